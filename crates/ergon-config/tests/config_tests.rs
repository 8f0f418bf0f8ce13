#[cfg(test)]
mod tests {
    use ergon_config::ConfigLoader;
    use ergon_config::schema::*;
    use ergon_core::TimeoutPolicy;
    use std::collections::HashMap;
    use std::io::Write;
    use std::path::Path;
    use std::time::Duration;

    // ── Default tests ──────────────────────────────────────────

    #[test]
    fn test_runner_config_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.max_tool_calls, 5);
        assert_eq!(config.timeout_policy, "log");
        assert_eq!(config.resolver, "structured");
        assert_eq!(config.temperature, 0.7);
        assert!(config.default_timeout().is_none());
        assert_eq!(config.policy(), TimeoutPolicy::Log);
    }

    #[test]
    fn test_backend_config_defaults() {
        let config = BackendConfig::default();
        assert_eq!(config.model, "local/llama3");
        assert_eq!(config.local_base_url, "http://127.0.0.1:11434");
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_logging_config_defaults() {
        let config = LoggingConfig::default();
        assert_eq!(config.level, "info");
        assert_eq!(config.format, "pretty");
    }

    #[test]
    fn test_trace_absolute_path_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let abs = dir.path().join("t.db");
        let config = TraceConfig {
            db_path: abs.clone(),
            in_memory: false,
        };
        assert_eq!(config.resolved_db_path(), abs);
    }

    #[test]
    fn test_memory_config_defaults() {
        let config = MemoryConfig::default();
        assert_eq!(config.max_entries_per_agent, 200);
        assert!(!config.in_memory);
        assert!(config.resolved_db_path().ends_with(".ergon/memory.db"));
    }

    // ── TOML tests ─────────────────────────────────────────────

    #[test]
    fn test_config_toml_roundtrip() {
        let config = ErgonConfig::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let restored: ErgonConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(restored.backend.model, config.backend.model);
        assert_eq!(restored.runner.max_tool_calls, config.runner.max_tool_calls);
    }

    #[test]
    fn test_partial_toml_applies_defaults() {
        let toml_str = r#"
[runner]
default_timeout_secs = 30
timeout_policy = "kill"
"#;
        let config: ErgonConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.runner.default_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.runner.policy(), TimeoutPolicy::Kill);
        assert_eq!(config.runner.max_tool_calls, 5);
        assert_eq!(config.backend.model, "local/llama3");
    }

    #[test]
    fn test_parse_reports_origin_on_error() {
        let err = ConfigLoader::parse("[runner\nbroken", Path::new("bad.toml")).unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }

    // ── Loader tests ───────────────────────────────────────────

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ergon.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "[backend]\nmodel = \"mock/echo\"\n[runner]\nmax_tool_calls = 3").unwrap();

        let loader = ConfigLoader::load(Some(&path)).unwrap();
        let config = loader.get();
        assert_eq!(config.backend.model, "mock/echo");
        assert_eq!(config.runner.max_tool_calls, 3);
        assert_eq!(loader.path(), path.as_path());
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loader = ConfigLoader::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(loader.get().runner.max_tool_calls, 5);
        assert!(!loader.from_file());
    }

    #[test]
    fn test_load_keeps_warnings_for_later_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ergon.toml");
        std::fs::write(
            &path,
            "[runner]\nmax_tool_calls = 0\ndefault_timeout_secs = 30\n[backend]\nmodel = \"mock/echo\"\n",
        )
        .unwrap();

        let loader = ConfigLoader::load(Some(&path)).unwrap();
        assert!(loader.from_file());
        let fields: Vec<&str> = loader.warnings().iter().map(|w| w.field.as_str()).collect();
        assert_eq!(fields, vec!["runner.max_tool_calls"]);
        loader.report();
    }

    #[test]
    fn test_load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ergon.toml");
        std::fs::write(&path, "[runner]\ntemperature = 5.0\n").unwrap();
        assert!(ConfigLoader::load(Some(&path)).is_err());
    }

    #[test]
    fn test_overrides_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("ERGON_MODEL", "ollama/mistral"),
            ("ERGON_TIMEOUT_SECS", "12"),
            ("ERGON_TIMEOUT_POLICY", "alarm"),
            ("ERGON_TRACE_DB", "/tmp/ergon-trace.db"),
            ("ERGON_MEMORY_DB", "/tmp/ergon-memory.db"),
        ]);
        let config = ConfigLoader::apply_overrides(ErgonConfig::default(), |k| {
            vars.get(k).map(|v| v.to_string())
        });
        assert_eq!(config.backend.model, "ollama/mistral");
        assert_eq!(config.runner.default_timeout_secs, 12);
        assert_eq!(config.runner.policy(), TimeoutPolicy::Alarm);
        assert_eq!(config.trace.db_path, Path::new("/tmp/ergon-trace.db"));
        assert_eq!(config.memory.db_path, Path::new("/tmp/ergon-memory.db"));
    }

    #[test]
    fn test_override_ignores_bad_timeout() {
        let config = ConfigLoader::apply_overrides(ErgonConfig::default(), |k| {
            (k == "ERGON_TIMEOUT_SECS").then(|| "soon".to_string())
        });
        assert_eq!(config.runner.default_timeout_secs, 0);
    }

    // ── Validation tests ───────────────────────────────────────

    #[test]
    fn test_validate_defaults_only_info() {
        let warnings = ErgonConfig::default().validate().unwrap();
        assert!(warnings.iter().all(|w| w.severity == WarningSeverity::Info));
    }

    #[test]
    fn test_validate_unknown_policy_is_warning() {
        let mut config = ErgonConfig::default();
        config.runner.timeout_policy = "explode".into();
        let warnings = config.validate().unwrap();
        assert!(warnings.iter().any(|w| w.field == "runner.timeout_policy"));
    }

    #[test]
    fn test_validate_unknown_resolver_is_error() {
        let mut config = ErgonConfig::default();
        config.runner.resolver = "psychic".into();
        let err = config.validate().unwrap_err();
        assert!(err.contains("runner.resolver"));
    }

    #[test]
    fn test_validate_bad_base_url_is_error() {
        let mut config = ErgonConfig::default();
        config.backend.local_base_url = "127.0.0.1:11434".into();
        assert!(config.validate().is_err());
    }
}
