mod api;

pub use api::{
    AssistantMessage, ChatChoice, ChatRequest, ChatResponse, ContentPart, HealthResponse,
    ImagePayload, Message, MessageContent, MetricsResponse,
};
