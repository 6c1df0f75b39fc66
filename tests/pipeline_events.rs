use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};

use etcd_archive::{
    archive::{ArchiveStore, Archiver},
    error::{ArchiveError, Result},
    mapper::PrefixMap,
    pipeline::Pipeline,
    source::{GetResponse, Node, SourceError, WatchEvent, WatchSource},
    tuple::{Element, Tuple},
};

const PAYLOAD_V1: &str = r#"{"metadata":{"uid":"U1"}}"#;
const PAYLOAD_V2: &str = r#"{"metadata":{"uid":"U1"},"v":2}"#;

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Create(String, String, String, String, u64, Vec<u8>),
    Update(String, String, String, String, u64, Vec<u8>),
    Delete(String, String, String, String, u64),
}

#[derive(Default)]
struct RecordingArchiver {
    ops: Mutex<Vec<Op>>,
}

impl RecordingArchiver {
    fn ops(&self) -> Vec<Op> {
        self.ops.lock().clone()
    }
}

impl Archiver for RecordingArchiver {
    fn create(
        &self,
        resource: &str,
        namespace: &str,
        name: &str,
        uid: &str,
        index: u64,
        current: &[u8],
    ) -> Result<()> {
        self.ops.lock().push(Op::Create(
            resource.into(),
            namespace.into(),
            name.into(),
            uid.into(),
            index,
            current.to_vec(),
        ));
        Ok(())
    }

    fn update(
        &self,
        resource: &str,
        namespace: &str,
        name: &str,
        uid: &str,
        index: u64,
        current: &[u8],
    ) -> Result<()> {
        self.ops.lock().push(Op::Update(
            resource.into(),
            namespace.into(),
            name.into(),
            uid.into(),
            index,
            current.to_vec(),
        ));
        Ok(())
    }

    fn delete(
        &self,
        resource: &str,
        namespace: &str,
        name: &str,
        uid: &str,
        index: u64,
    ) -> Result<()> {
        self.ops.lock().push(Op::Delete(
            resource.into(),
            namespace.into(),
            name.into(),
            uid.into(),
            index,
        ));
        Ok(())
    }
}

/// Source for translation-only tests: nothing to get, nothing to watch.
struct IdleSource;

#[async_trait]
impl WatchSource for IdleSource {
    async fn get(&self, _: &str, _: bool, _: bool) -> std::result::Result<GetResponse, SourceError> {
        Ok(GetResponse {
            node: None,
            etcd_index: 1,
        })
    }

    async fn watch(
        &self,
        _: &str,
        _: u64,
        _: bool,
        _: mpsc::Sender<WatchEvent>,
    ) -> std::result::Result<(), SourceError> {
        std::future::pending().await
    }
}

fn node(key: &str, value: &str, created: u64, modified: u64) -> Node {
    Node {
        key: key.to_string(),
        value: value.to_string(),
        created_index: created,
        modified_index: modified,
    }
}

fn event(action: &str, node: Option<Node>, prev_node: Option<Node>, etcd_index: u64) -> WatchEvent {
    WatchEvent {
        action: action.to_string(),
        node,
        prev_node,
        etcd_index,
    }
}

fn recording_pipeline() -> (Pipeline<IdleSource>, Arc<RecordingArchiver>) {
    let archiver = Arc::new(RecordingArchiver::default());
    let pipeline = Pipeline::new(
        IdleSource,
        Arc::clone(&archiver) as Arc<dyn Archiver>,
        PrefixMap::cluster_defaults(),
    );
    (pipeline, archiver)
}

#[test]
fn translates_genesis_create() {
    let (pipeline, archiver) = recording_pipeline();
    let result = pipeline.apply(&event(
        "create",
        Some(node("/kubernetes.io/pods/default/p1", PAYLOAD_V1, 10, 10)),
        None,
        10,
    ));

    assert_eq!(result.unwrap(), 10);
    assert_eq!(
        archiver.ops(),
        vec![Op::Create(
            "pods".into(),
            "default".into(),
            "p1".into(),
            "U1".into(),
            10,
            PAYLOAD_V1.as_bytes().to_vec(),
        )]
    );
}

#[test]
fn replays_previous_create_before_the_replacement() {
    let (pipeline, archiver) = recording_pipeline();
    // previous version never modified: archived as a create at its own index
    let result = pipeline.apply(&event(
        "set",
        Some(node("/kubernetes.io/pods/default/p1", PAYLOAD_V2, 10, 15)),
        Some(node("/kubernetes.io/pods/default/p1", PAYLOAD_V1, 10, 10)),
        15,
    ));

    assert_eq!(result.unwrap(), 15);
    assert_eq!(
        archiver.ops(),
        vec![
            Op::Create(
                "pods".into(),
                "default".into(),
                "p1".into(),
                "U1".into(),
                10,
                PAYLOAD_V1.as_bytes().to_vec(),
            ),
            Op::Update(
                "pods".into(),
                "default".into(),
                "p1".into(),
                "U1".into(),
                15,
                PAYLOAD_V2.as_bytes().to_vec(),
            ),
        ]
    );
}

#[test]
fn replays_previous_update_before_the_replacement() {
    let (pipeline, archiver) = recording_pipeline();
    // previous version had already been modified once
    let result = pipeline.apply(&event(
        "set",
        Some(node("/kubernetes.io/pods/default/p1", PAYLOAD_V2, 10, 20)),
        Some(node("/kubernetes.io/pods/default/p1", PAYLOAD_V1, 10, 15)),
        20,
    ));

    assert_eq!(result.unwrap(), 20);
    let ops = archiver.ops();
    assert_eq!(ops.len(), 2);
    assert!(matches!(&ops[0], Op::Update(_, _, _, _, 15, _)));
    assert!(matches!(&ops[1], Op::Update(_, _, _, _, 20, _)));
}

#[test]
fn records_deletion_with_uid_from_previous_node() {
    let (pipeline, archiver) = recording_pipeline();
    let result = pipeline.apply(&event(
        "delete",
        Some(node("/kubernetes.io/pods/default/p1", "", 10, 25)),
        Some(node("/kubernetes.io/pods/default/p1", PAYLOAD_V1, 10, 15)),
        25,
    ));

    assert_eq!(result.unwrap(), 25);
    assert_eq!(
        archiver.ops(),
        vec![Op::Delete(
            "pods".into(),
            "default".into(),
            "p1".into(),
            "U1".into(),
            25,
        )]
    );
}

#[test]
fn ignores_unmapped_paths_but_advances() {
    let (pipeline, archiver) = recording_pipeline();
    let result = pipeline.apply(&event(
        "create",
        Some(node("/unknown.io/widgets/x", "{}", 10, 10)),
        None,
        10,
    ));

    assert_eq!(result.unwrap(), 10);
    assert!(archiver.ops().is_empty());
}

#[test]
fn ignores_quorum_get_echoes() {
    let (pipeline, archiver) = recording_pipeline();
    let result = pipeline.apply(&event(
        "get",
        Some(node("/kubernetes.io/pods/default/p1", PAYLOAD_V1, 10, 10)),
        None,
        12,
    ));

    assert_eq!(result.unwrap(), 10);
    assert!(archiver.ops().is_empty());
}

#[test]
fn event_without_nodes_reports_the_horizon() {
    let (pipeline, archiver) = recording_pipeline();
    let result = pipeline.apply(&event("create", None, None, 42));
    assert_eq!(result.unwrap(), 42);
    assert!(archiver.ops().is_empty());
}

#[test]
fn previous_node_without_current_is_malformed() {
    let (pipeline, _archiver) = recording_pipeline();
    let result = pipeline.apply(&event(
        "delete",
        None,
        Some(node("/kubernetes.io/pods/default/p1", PAYLOAD_V1, 10, 15)),
        25,
    ));
    assert!(matches!(result, Err(ArchiveError::MalformedEvent(_))));
}

#[test]
fn deletion_without_previous_node_is_malformed() {
    let (pipeline, archiver) = recording_pipeline();
    let result = pipeline.apply(&event(
        "delete",
        Some(node("/kubernetes.io/pods/default/p1", "", 10, 25)),
        None,
        25,
    ));
    assert!(matches!(result, Err(ArchiveError::MalformedEvent(_))));
    assert!(archiver.ops().is_empty());
}

#[test]
fn unrecognized_actions_are_reported() {
    let (pipeline, archiver) = recording_pipeline();
    let result = pipeline.apply(&event(
        "update",
        Some(node("/kubernetes.io/pods/default/p1", PAYLOAD_V1, 10, 11)),
        None,
        11,
    ));
    assert!(matches!(
        result,
        Err(ArchiveError::UnrecognizedAction { .. })
    ));
    assert!(archiver.ops().is_empty());
}

#[test]
fn uid_extraction_failure_degrades_to_empty_uid() {
    let (pipeline, archiver) = recording_pipeline();
    let result = pipeline.apply(&event(
        "create",
        Some(node("/kubernetes.io/pods/default/p1", "not json", 10, 10)),
        None,
        10,
    ));

    assert_eq!(result.unwrap(), 10);
    assert_eq!(
        archiver.ops(),
        vec![Op::Create(
            "pods".into(),
            "default".into(),
            "p1".into(),
            String::new(),
            10,
            b"not json".to_vec(),
        )]
    );
}

#[test]
fn archives_the_full_lifecycle_into_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ArchiveStore::open(dir.path().join("archive.db")).unwrap());
    let pipeline = Pipeline::new(
        IdleSource,
        Arc::clone(&store) as Arc<dyn Archiver>,
        PrefixMap::cluster_defaults(),
    );

    let path = "/kubernetes.io/pods/default/p1";
    pipeline
        .apply(&event("create", Some(node(path, PAYLOAD_V1, 10, 10)), None, 10))
        .unwrap();
    pipeline
        .apply(&event(
            "set",
            Some(node(path, PAYLOAD_V2, 10, 15)),
            Some(node(path, PAYLOAD_V1, 10, 10)),
            15,
        ))
        .unwrap();
    pipeline
        .apply(&event(
            "delete",
            Some(node(path, "", 10, 25)),
            Some(node(path, PAYLOAD_V2, 10, 15)),
            25,
        ))
        .unwrap();

    // versions and uid are gone, the event log retains all three operations
    let versions_prefix = Tuple(vec!["pods".into(), "default".into(), "p1".into()]).pack();
    assert!(store.scan_prefix(&versions_prefix).unwrap().is_empty());
    let uid_prefix = Tuple(vec!["U1".into()]).pack();
    assert!(store.scan_prefix(&uid_prefix).unwrap().is_empty());

    let ops: Vec<(u64, u8)> = store
        .scan_prefix(&[])
        .unwrap()
        .into_iter()
        .filter_map(|(key, _)| {
            let tuple = Tuple::unpack(&key).unwrap();
            match (tuple.elements().first(), tuple.elements().last()) {
                (Some(Element::Int(index)), Some(Element::Bytes(op))) => Some((*index, op[0])),
                _ => None,
            }
        })
        .collect();
    assert_eq!(ops, vec![(10, 0), (15, 1), (25, 2)]);

    // the deletion is recorded against the namespace with its final version
    let deleted_key = Tuple(vec![
        "pods".into(),
        "default".into(),
        25u64.into(),
        "U1".into(),
    ])
    .pack();
    let deleted = store.scan_prefix(&deleted_key).unwrap();
    assert_eq!(deleted[0].1, Tuple(vec![15u64.into()]).pack());
}

/// Source scripted with one watch outcome per attempt; later attempts pend
/// until the pipeline is shut down.
struct ScriptedSource {
    horizon: u64,
    results: Mutex<VecDeque<std::result::Result<(), SourceError>>>,
    watches: Arc<Mutex<Vec<u64>>>,
}

#[async_trait]
impl WatchSource for ScriptedSource {
    async fn get(&self, _: &str, _: bool, _: bool) -> std::result::Result<GetResponse, SourceError> {
        Ok(GetResponse {
            node: None,
            etcd_index: self.horizon,
        })
    }

    async fn watch(
        &self,
        _: &str,
        from_index: u64,
        _: bool,
        _: mpsc::Sender<WatchEvent>,
    ) -> std::result::Result<(), SourceError> {
        self.watches.lock().push(from_index);
        match self.results.lock().pop_front() {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }
}

fn outdated(index: u64) -> SourceError {
    SourceError::Api {
        code: 401,
        message: "the event in requested index is outdated and cleared".to_string(),
        index: Some(index),
    }
}

#[tokio::test(start_paused = true)]
async fn reconnect_shrinks_the_window_and_resets_after_success() {
    let watches = Arc::new(Mutex::new(Vec::new()));
    let source = ScriptedSource {
        horizon: 10_000,
        results: Mutex::new(VecDeque::from([
            Err(outdated(12_000)),
            Ok(()),
            Err(outdated(20_000)),
        ])),
        watches: Arc::clone(&watches),
    };
    let archiver = Arc::new(RecordingArchiver::default());
    let pipeline = Arc::new(Pipeline::new(
        source,
        archiver as Arc<dyn Archiver>,
        PrefixMap::cluster_defaults(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run = tokio::spawn(Arc::clone(&pipeline).run(shutdown_rx));

    timeout(Duration::from_secs(30), async {
        while watches.lock().len() < 4 {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("watcher never reached the fourth attempt");

    shutdown_tx.send(true).unwrap();
    run.await.unwrap().unwrap();

    // horizon 10000 starts one window back; the first failure shrinks the
    // window to 900 behind the reported index; success resets it to 1000
    assert_eq!(watches.lock().clone(), vec![9_001, 11_100, 11_100, 19_100]);
}
