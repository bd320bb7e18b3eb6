//! Unit tests for API models.
#![allow(clippy::unwrap_used, clippy::expect_used)]

use serde_json::json;

mod request_tests {
    use super::*;
    use inference_gate::models::{ChatRequest, MessageContent};

    #[test]
    fn test_string_content() {
        let request: ChatRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();

        assert_eq!(request.max_tokens, 128);
        assert!(matches!(
            request.messages[0].content,
            Some(MessageContent::Text(ref text)) if text == "hi"
        ));
    }

    #[test]
    fn test_part_content() {
        let request: ChatRequest = serde_json::from_value(json!({
            "model": "m",
            "max_tokens": 64,
            "temperature": 0.7,
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "look"},
                {"type": "image_url", "image": {"b64": "AAAA"}}
            ]}]
        }))
        .unwrap();

        assert_eq!(request.max_tokens, 64);
        let Some(MessageContent::Parts(parts)) = &request.messages[0].content else {
            panic!("expected parts");
        };
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].kind, "text");
        assert_eq!(parts[1].kind, "image_url");
        assert_eq!(
            parts[1].image.as_ref().and_then(|i| i.b64.as_deref()),
            Some("AAAA")
        );
    }

    #[test]
    fn test_null_content_allowed() {
        let request: ChatRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [{"role": "assistant", "content": null}, {"role": "user"}]
        }))
        .unwrap();
        assert!(request.messages.iter().all(|m| m.content.is_none()));
    }

    #[test]
    fn test_missing_model_rejected() {
        let result = serde_json::from_value::<ChatRequest>(json!({"messages": []}));
        assert!(result.is_err());
    }
}

mod response_tests {
    use super::*;
    use inference_gate::metrics::RequestSummary;
    use inference_gate::models::{ChatResponse, HealthResponse, MetricsResponse};
    use inference_gate::services::AbuseStats;
    use inference_gate::services::inference::ModelState;

    #[test]
    fn test_completion_shape() {
        let response = ChatResponse::completion(
            "0f8fad5b-d9cb-469f-a165-70867728950e",
            "m".to_string(),
            "done".to_string(),
        );

        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({
                "id": "chatcmpl-0f8fad5b",
                "object": "chat.completion",
                "model": "m",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "done"},
                    "finish_reason": "stop"
                }]
            })
        );
    }

    #[test]
    fn test_health_serializes_state() {
        let response = HealthResponse {
            status: ModelState::NotLoaded,
            model: "m".to_string(),
            load_error: None,
            version: "0.1.0".to_string(),
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["status"], "not_loaded");
        assert!(value["load_error"].is_null());
    }

    #[test]
    fn test_metrics_rounds_latency() {
        let summary = RequestSummary {
            total: 10,
            success: 7,
            client_errors: 2,
            server_errors: 1,
            p50_ms: 12.3456,
            p95_ms: 99.999,
        };
        let stats = AbuseStats {
            denied_count: 1,
            tracked_entities: 4,
            threshold_errors: 5,
            window_seconds: 30,
        };

        let value = serde_json::to_value(MetricsResponse::new(summary, 42, stats)).unwrap();
        assert_eq!(value["requests_total"], 10);
        assert_eq!(value["requests_2xx"], 7);
        assert_eq!(value["requests_4xx"], 2);
        assert_eq!(value["requests_5xx"], 1);
        assert_eq!(value["latency_p50_ms"], 12.35);
        assert_eq!(value["latency_p95_ms"], 100.0);
        assert_eq!(value["uptime_seconds"], 42);
        assert_eq!(value["abuse_stats"]["tracked_entities"], 4);
    }
}
