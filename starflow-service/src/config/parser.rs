// Pipeline YAML parser

use crate::config::error::ParseError;
use crate::config::models::PipelineDef;

use std::path::Path;

pub struct PipelineParser;

impl PipelineParser {
    /// Parse a pipeline definition from YAML text
    pub fn parse_str(content: &str) -> Result<PipelineDef, ParseError> {
        serde_yaml::from_str(content).map_err(|e| ParseError::from_yaml_error(&e, content))
    }

    /// Read and parse a pipeline definition file
    pub fn parse_file(path: impl AsRef<Path>) -> Result<PipelineDef, ParseError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ParseError::io(format!("failed to read {}: {}", path.display(), e)))?;
        Self::parse_str(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::error::ParseErrorKind;
    use crate::config::models::Action;
    use crate::storage::Probe;

    const SPARKIFY: &str = r#"
name: sparkify
description: Load song plays into the star schema
settings:
  max_concurrency: 2
  retry: { retries: 3, backoff_ms: 500, max_backoff_ms: 4000 }
tasks:
  - id: begin
    action: { kind: barrier }
  - id: stage_events
    depends_on: [begin]
    action:
      kind: stage_load
      source: data/log_data
      target: staging_events
  - id: load_songplays
    depends_on: [stage_events]
    timeout_secs: 120
    action:
      kind: fact_load
      from: { relation: staging_events }
      target: songplays
      key: [start_time, user_id, session_id]
      filter: { field: page, equals: NextSong }
      columns:
        - { name: start_time, field: ts, derive: timestamp }
        - { name: user_id, field: userId }
        - { name: session_id, field: sessionId }
      lookups:
        - relation: songs
          on: { title: song, duration: length }
          resolve: { song_id: song_id }
  - id: quality
    depends_on: [load_songplays]
    retry: { retries: 0 }
    action:
      kind: quality_check
      checks:
        - probe: { kind: null_count, relation: songplays, column: user_id }
          expected: 0
        - name: songplays present
          probe: { kind: row_count, relation: songplays }
          expected: 0
          comparison: gt
"#;

    #[test]
    fn test_parse_full_pipeline() {
        let def = PipelineParser::parse_str(SPARKIFY).unwrap();

        assert_eq!(def.name, "sparkify");
        assert_eq!(def.settings.max_concurrency, 2);
        assert_eq!(def.settings.retry.backoff_ms, 500);
        assert_eq!(def.tasks.len(), 4);

        let fact = &def.tasks[2];
        assert_eq!(fact.timeout_secs, Some(120));
        match &fact.action {
            Action::FactLoad(load) => {
                assert_eq!(load.key.len(), 3);
                assert_eq!(load.lookups[0].on.get("title").map(String::as_str), Some("song"));
                assert!(load.filter.is_some());
            }
            other => panic!("unexpected action {:?}", other),
        }

        let gate = &def.tasks[3];
        assert_eq!(gate.retry.map(|r| r.retries), Some(0));
        match &gate.action {
            Action::QualityCheck(gate) => {
                assert_eq!(gate.checks.len(), 2);
                assert!(matches!(gate.checks[0].probe, Probe::NullCount { .. }));
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_unknown_action_kind_has_suggestion() {
        let yaml = "name: p\ntasks:\n  - id: a\n    action: { kind: copy_files }\n";
        let err = PipelineParser::parse_str(yaml).unwrap_err();

        assert_eq!(err.kind, ParseErrorKind::InvalidSchema);
        assert!(err.message.contains("copy_files"));
        assert!(err.suggestion.is_some());
    }

    #[test]
    fn test_missing_file() {
        let err = PipelineParser::parse_file("/definitely/not/here.yaml").unwrap_err();
        assert_eq!(err.kind, ParseErrorKind::IoError);
    }
}
