#[cfg(test)]
mod tests {
    use ergon_core::*;
    use serde_json::json;
    use uuid::Uuid;

    // ── Turn tests ─────────────────────────────────────────────

    #[test]
    fn test_turn_text_constructor() {
        let eid = Uuid::new_v4();
        let turn = Turn::text(eid, 1, Role::User, "hello");
        assert_eq!(turn.role, Role::User);
        assert_eq!(turn.content, "hello");
        assert_eq!(turn.seq, 1);
        assert_eq!(turn.execution_id, eid);
        assert!(turn.invocation.is_none());
    }

    #[test]
    fn test_turn_serde_roundtrip_keeps_invocation() {
        let turn = Turn::tool(
            Uuid::new_v4(),
            2,
            "get_weather",
            json!({"location": "Boston"}),
            InvocationResult::Value("72F".into()),
        );
        let raw = serde_json::to_string(&turn).unwrap();
        let restored: Turn = serde_json::from_str(&raw).unwrap();
        let inv = restored.invocation.unwrap();
        assert_eq!(inv.tool_name, "get_weather");
        assert_eq!(inv.arguments["location"], "Boston");
        assert_eq!(inv.result, Some(InvocationResult::Value("72F".into())));
    }

    #[test]
    fn test_role_parse() {
        for role in [Role::System, Role::User, Role::Assistant, Role::Tool] {
            assert_eq!(role.as_str().parse::<Role>().unwrap(), role);
        }
        assert!("function".parse::<Role>().is_err());
    }

    // ── Error tests ────────────────────────────────────────────

    #[test]
    fn test_error_backend_unreachable_display() {
        let err = ErgonError::BackendUnreachable {
            attempts: 4,
            reason: "connection refused".into(),
        };
        let s = err.to_string();
        assert!(s.contains('4'));
        assert!(s.contains("connection refused"));
    }

    #[test]
    fn test_error_sink_helper() {
        let id = Uuid::new_v4();
        let err = ErgonError::sink(id, "disk full");
        assert!(err.to_string().contains(&id.to_string()));
        assert!(err.to_string().contains("disk full"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ErgonError = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }

    // ── Event bus tests ────────────────────────────────────────

    #[tokio::test]
    async fn test_event_bus_delivers_to_subscribers() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();
        let id = Uuid::new_v4();
        bus.publish(EngineEvent::ExecutionStarted {
            execution_id: id,
            agent: "weather".into(),
        });
        match rx.recv().await.unwrap() {
            EngineEvent::ExecutionStarted { execution_id, agent } => {
                assert_eq!(execution_id, id);
                assert_eq!(agent, "weather");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_event_bus_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(EngineEvent::ToolDispatched {
            execution_id: Uuid::nil(),
            tool_name: "noop".into(),
        });
    }

    #[test]
    fn test_event_serializes_with_kind_tag() {
        let event = EngineEvent::ExecutionFinished {
            execution_id: Uuid::nil(),
            outcome: Outcome::TimedOut,
            elapsed_ms: 1000,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["kind"], "execution_finished");
        assert_eq!(value["outcome"], "timed_out");
    }
}
