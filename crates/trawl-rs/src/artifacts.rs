//! Per-step debug artifacts: prompt text and state snapshots written to an
//! inspection directory. Failures are logged and otherwise ignored — the
//! loop never stops over a debug file.

use crate::Message;
use crate::agent::state::AgentState;
use std::path::PathBuf;
use tracing::warn;

/// Writes one file set per step into `dir`.
pub struct ArtifactWriter {
    dir: PathBuf,
}

impl ArtifactWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("failed to create artifacts dir {}: {e}", dir.display());
        }
        Self { dir }
    }

    /// Persist the step's prompt and the current session state.
    pub fn store_step(&self, system_prompt: &str, state: &AgentState, messages: &[Message]) {
        self.write(
            &format!("prompt-{}.txt", state.total_step),
            system_prompt.as_bytes(),
        );
        self.write_json("context.json", &state.context_log);
        self.write_json("queries.json", &state.all_keywords);
        self.write_json("questions.json", &state.all_questions);
        self.write_json("knowledge.json", &state.knowledge);
        self.write_json("urls.json", &state.url_pool.by_weight());
        self.write_json("messages.json", &messages);
    }

    fn write_json<T: serde::Serialize>(&self, name: &str, value: &T) {
        match serde_json::to_vec_pretty(value) {
            Ok(bytes) => self.write(name, &bytes),
            Err(e) => warn!("failed to serialize {name}: {e}"),
        }
    }

    fn write(&self, name: &str, bytes: &[u8]) {
        let path = self.dir.join(name);
        if let Err(e) = std::fs::write(&path, bytes) {
            warn!("failed to write {}: {e}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_step_writes_expected_files() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::new(dir.path());
        let mut state = AgentState::new("q");
        state.total_step = 3;
        state.all_keywords.push("capital of France".into());

        writer.store_step("system prompt text", &state, &[Message::user("q")]);

        assert!(dir.path().join("prompt-3.txt").exists());
        for name in [
            "context.json",
            "queries.json",
            "questions.json",
            "knowledge.json",
            "urls.json",
            "messages.json",
        ] {
            assert!(dir.path().join(name).exists(), "missing {name}");
        }
        let queries = std::fs::read_to_string(dir.path().join("queries.json")).unwrap();
        assert!(queries.contains("capital of France"));
    }

    #[test]
    fn unwritable_dir_is_not_fatal() {
        let writer = ArtifactWriter::new("/proc/definitely-not-writable/artifacts");
        let state = AgentState::new("q");
        // Must not panic.
        writer.store_step("prompt", &state, &[]);
    }
}
