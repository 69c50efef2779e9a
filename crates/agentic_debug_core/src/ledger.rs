//! Breakpoint bookkeeping per source file.
//!
//! For each file the ledger keeps the last set from each source. Since
//! `setBreakpoints` replaces everything the adapter holds for a file, every
//! request carries the agent's set followed by the IDE's set, so neither side
//! wipes the other. Overlapping lines are sent as given.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::{backend::DebugBackend, lock, path_map::PathMapper, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointSpec {
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hit_condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_message: Option<String>,
}

impl BreakpointSpec {
    pub fn at(line: u32) -> Self {
        Self {
            line,
            condition: None,
            hit_condition: None,
            log_message: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BreakpointSource {
    Agent,
    Ide,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub source: BreakpointSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub path: String,
    #[serde(flatten)]
    pub spec: BreakpointSpec,
    pub verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[async_trait]
pub trait BreakpointLedger: Send + Sync {
    /// Replaces the agent's breakpoints for `path` and returns what the adapter confirmed.
    async fn add_agent_breakpoints(
        &self,
        request_id: &str,
        path: &str,
        specs: Vec<BreakpointSpec>,
    ) -> Result<Vec<LedgerEntry>>;

    async fn add_ide_breakpoints(&self, path: &str, specs: Vec<BreakpointSpec>) -> Result<Vec<LedgerEntry>>;

    fn get_for_file(&self, path: &str) -> Vec<LedgerEntry>;
}

type FileEntries = HashMap<BreakpointSource, Vec<LedgerEntry>>;

pub struct ForwardingLedger {
    backend: Arc<dyn DebugBackend>,
    mapper: Arc<dyn PathMapper>,
    files: Mutex<HashMap<String, FileEntries>>,
}

impl ForwardingLedger {
    pub fn new(backend: Arc<dyn DebugBackend>, mapper: Arc<dyn PathMapper>) -> Self {
        Self {
            backend,
            mapper,
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Files are keyed by local path, whichever side the caller named.
    fn key(&self, path: &str) -> String {
        self.mapper.to_local(path)
    }

    fn store(&self, key: String, source: BreakpointSource, entries: Vec<LedgerEntry>) {
        lock(&self.files).entry(key).or_default().insert(source, entries);
    }

    fn stored_specs(&self, key: &str, source: BreakpointSource) -> Vec<BreakpointSpec> {
        lock(&self.files)
            .get(key)
            .and_then(|file| file.get(&source))
            .map(|entries| entries.iter().map(|e| e.spec.clone()).collect())
            .unwrap_or_default()
    }

    /// Sends the full breakpoint set for a file and returns the adapter's per-breakpoint replies.
    async fn send_file(&self, key: &str, specs: &[BreakpointSpec]) -> Result<Vec<Value>> {
        // The adapter applies its own pathMappings, so it gets the local path.
        let response = self
            .backend
            .send_request(
                "setBreakpoints",
                Some(json!({
                    "source": { "path": key },
                    "breakpoints": specs,
                })),
            )
            .await?;

        Ok(response
            .body()
            .get("breakpoints")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl BreakpointLedger for ForwardingLedger {
    async fn add_agent_breakpoints(
        &self,
        request_id: &str,
        path: &str,
        specs: Vec<BreakpointSpec>,
    ) -> Result<Vec<LedgerEntry>> {
        let key = self.key(path);
        let mut outgoing = specs.clone();
        outgoing.extend(self.stored_specs(&key, BreakpointSource::Ide));
        // Agent specs lead, so the first replies line up with them.
        let confirmed = self.send_file(&key, &outgoing).await?;

        let entries: Vec<LedgerEntry> = specs
            .into_iter()
            .enumerate()
            .map(|(i, spec)| {
                let reply = confirmed.get(i);
                let field = |name: &str| reply.and_then(|r| r.get(name));
                LedgerEntry {
                    source: BreakpointSource::Agent,
                    request_id: Some(request_id.to_string()),
                    path: key.clone(),
                    spec: BreakpointSpec {
                        line: field("line")
                            .and_then(Value::as_u64)
                            .and_then(|l| u32::try_from(l).ok())
                            .unwrap_or(spec.line),
                        ..spec
                    },
                    verified: field("verified").and_then(Value::as_bool).unwrap_or(false),
                    id: field("id").and_then(Value::as_i64),
                    message: field("message").and_then(Value::as_str).map(str::to_string),
                }
            })
            .collect();

        tracing::debug!(request_id, path = %key, count = entries.len(), "Agent breakpoints set");
        self.store(key, BreakpointSource::Agent, entries.clone());
        Ok(entries)
    }

    async fn add_ide_breakpoints(&self, path: &str, specs: Vec<BreakpointSpec>) -> Result<Vec<LedgerEntry>> {
        let key = self.key(path);
        let entries: Vec<LedgerEntry> = specs
            .into_iter()
            .map(|spec| LedgerEntry {
                source: BreakpointSource::Ide,
                request_id: None,
                path: key.clone(),
                spec,
                verified: true,
                id: None,
                message: None,
            })
            .collect();

        if self.backend.is_alive() {
            let mut outgoing = self.stored_specs(&key, BreakpointSource::Agent);
            outgoing.extend(entries.iter().map(|e| e.spec.clone()));
            self.send_file(&key, &outgoing).await?;
        }

        tracing::debug!(path = %key, count = entries.len(), "IDE breakpoints recorded");
        self.store(key, BreakpointSource::Ide, entries.clone());
        Ok(entries)
    }

    fn get_for_file(&self, path: &str) -> Vec<LedgerEntry> {
        let key = self.key(path);
        let files = lock(&self.files);
        let Some(file) = files.get(&key) else {
            return Vec::new();
        };
        [BreakpointSource::Agent, BreakpointSource::Ide]
            .iter()
            .filter_map(|source| file.get(source))
            .flatten()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::PathMappings, path_map::PrefixPathMapper, testing::FakeBackend};

    fn ledger(backend: Arc<FakeBackend>) -> ForwardingLedger {
        let mut mappings = PathMappings::new();
        mappings.insert("/var/www".into(), "/home/dev/site".into());
        ForwardingLedger::new(backend, Arc::new(PrefixPathMapper::from_config(&mappings)))
    }

    #[tokio::test]
    async fn test_agent_breakpoints_forward_local_path_and_record_reply() {
        let backend = Arc::new(FakeBackend::new());
        backend.respond(
            "setBreakpoints",
            json!({ "breakpoints": [
                { "verified": true, "line": 12, "id": 1 },
                { "verified": false, "line": 40, "message": "no code" },
            ]}),
        );
        let ledger = ledger(backend.clone());

        let mut conditional = BreakpointSpec::at(40);
        conditional.condition = Some("$i > 3".into());
        let entries = ledger
            .add_agent_breakpoints("req-1", "/var/www/index.php", vec![BreakpointSpec::at(12), conditional])
            .await
            .expect("set breakpoints");

        let (command, args) = backend.requests().pop().expect("one request");
        assert_eq!(command, "setBreakpoints");
        let args = args.expect("arguments");
        assert_eq!(args["source"]["path"], "/home/dev/site/index.php");
        assert_eq!(args["breakpoints"][1]["condition"], "$i > 3");
        assert!(args["breakpoints"][0].get("condition").is_none());

        assert_eq!(entries.len(), 2);
        assert!(entries[0].verified);
        assert_eq!(entries[0].id, Some(1));
        assert_eq!(entries[1].message.as_deref(), Some("no code"));
        assert_eq!(entries[1].request_id.as_deref(), Some("req-1"));
    }

    #[tokio::test]
    async fn test_last_set_per_source_is_kept() {
        let backend = Arc::new(FakeBackend::new());
        let ledger = ledger(backend);

        ledger
            .add_ide_breakpoints("/home/dev/site/a.php", vec![BreakpointSpec::at(3)])
            .await
            .expect("ide");
        ledger
            .add_agent_breakpoints("r1", "/home/dev/site/a.php", vec![BreakpointSpec::at(5), BreakpointSpec::at(6)])
            .await
            .expect("agent");
        ledger
            .add_agent_breakpoints("r2", "/var/www/a.php", vec![BreakpointSpec::at(9)])
            .await
            .expect("agent again");

        let entries = ledger.get_for_file("/var/www/a.php");
        let lines: Vec<(BreakpointSource, u32)> = entries.iter().map(|e| (e.source, e.spec.line)).collect();
        assert_eq!(lines, vec![(BreakpointSource::Agent, 9), (BreakpointSource::Ide, 3)]);
        assert!(ledger.get_for_file("/home/dev/site/other.php").is_empty());
    }

    fn sent_lines(args: &Option<Value>) -> Vec<u64> {
        args.as_ref().expect("arguments")["breakpoints"]
            .as_array()
            .expect("breakpoint list")
            .iter()
            .filter_map(|bp| bp["line"].as_u64())
            .collect()
    }

    #[tokio::test]
    async fn test_agent_request_keeps_ide_breakpoints_at_the_adapter() {
        let backend = Arc::new(FakeBackend::new());
        backend.respond(
            "setBreakpoints",
            json!({ "breakpoints": [
                { "verified": true, "line": 9, "id": 7 },
                { "verified": true, "line": 3, "id": 8 },
            ]}),
        );
        let ledger = ledger(backend.clone());

        ledger
            .add_ide_breakpoints("/home/dev/site/a.php", vec![BreakpointSpec::at(3)])
            .await
            .expect("ide");
        let entries = ledger
            .add_agent_breakpoints("r1", "/var/www/a.php", vec![BreakpointSpec::at(9)])
            .await
            .expect("agent");

        let (_, args) = backend.requests().pop().expect("setBreakpoints");
        assert_eq!(sent_lines(&args), vec![9, 3]);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, Some(7));
        assert_eq!(entries[0].source, BreakpointSource::Agent);
    }

    #[tokio::test]
    async fn test_ide_change_resends_union_only_while_live() {
        let backend = Arc::new(FakeBackend::new());
        let ledger = ledger(backend.clone());

        ledger
            .add_ide_breakpoints("/home/dev/site/a.php", vec![BreakpointSpec::at(1)])
            .await
            .expect("ide before launch");
        assert!(backend.requests().is_empty());

        backend.launch(json!({})).await.expect("launch");
        ledger
            .add_agent_breakpoints("r1", "/home/dev/site/a.php", vec![BreakpointSpec::at(5)])
            .await
            .expect("agent");
        ledger
            .add_ide_breakpoints("/home/dev/site/a.php", vec![BreakpointSpec::at(2), BreakpointSpec::at(4)])
            .await
            .expect("ide while live");

        let (command, args) = backend.requests().pop().expect("resend");
        assert_eq!(command, "setBreakpoints");
        assert_eq!(sent_lines(&args), vec![5, 2, 4]);
        let lines: Vec<u32> = ledger.get_for_file("/var/www/a.php").iter().map(|e| e.spec.line).collect();
        assert_eq!(lines, vec![5, 2, 4]);
    }
}
