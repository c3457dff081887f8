// SPDX-License-Identifier: GPL-3.0

//! Integration tests for the execution queue.

use pop_fork_core::{
	ErrorKind, ExecutionQueue, ExecutionTask, ExecutorConfig, ExecutorError, StorageStack,
	executor::{TaskOutput, TrieVersion},
	smoldot_engine_factory,
	testing::{MemoryProvider, MockEngine},
};
use std::sync::{Arc, Mutex};
use subxt::config::substrate::H256;
use tokio::sync::{RwLock, oneshot};

fn code() -> Arc<[u8]> {
	Arc::from(&b"mock-runtime"[..])
}

fn call(method: &str) -> ExecutionTask {
	ExecutionTask::Call {
		code: code(),
		block_hash: H256::zero(),
		calls: vec![(method.to_string(), vec![])],
	}
}

#[tokio::test]
async fn tasks_complete_in_submission_order() {
	let queue = ExecutionQueue::new(MockEngine::factory());
	let order = Arc::new(Mutex::new(Vec::new()));
	let mut done = Vec::new();

	for (i, method) in ["sleep:40", "fail", "sleep:10", "echo"].into_iter().enumerate() {
		let order = order.clone();
		let (tx, rx) = oneshot::channel();
		queue.add_and_run_task(call(method), None, move |result| {
			order.lock().unwrap().push((i, result.is_ok()));
			let _ = tx.send(());
		});
		done.push(rx);
	}
	for rx in done {
		rx.await.unwrap();
	}

	assert_eq!(*order.lock().unwrap(), vec![(0, true), (1, false), (2, true), (3, true)]);
}

#[tokio::test]
async fn engine_faults_fail_only_their_task() {
	let queue = ExecutionQueue::new(MockEngine::factory());

	let err = queue.call(code(), H256::zero(), "fail", vec![], None).await.unwrap_err();
	assert_eq!(err.kind(), ErrorKind::RuntimeCallFault);

	let result = queue.call(code(), H256::zero(), "echo", b"still here".to_vec(), None).await;
	assert_eq!(result.unwrap().output, b"still here".to_vec());
}

#[tokio::test]
async fn lost_worker_is_replaced() {
	let queue = ExecutionQueue::new(MockEngine::factory());

	let err = queue.call(code(), H256::zero(), "panic", vec![], None).await.unwrap_err();
	assert!(matches!(err, ExecutorError::WorkerUnavailable { .. }));

	let version = queue.runtime_version(code()).await.unwrap();
	assert_eq!(version.spec_name, "mock-runtime");
}

#[tokio::test]
async fn calls_read_the_submitting_stack() {
	let queue = ExecutionQueue::new(MockEngine::factory());
	let stack = Arc::new(RwLock::new(StorageStack::new(Arc::new(MemoryProvider::new([
		("k:1", "a"),
		("k:2", "b"),
	])))));
	stack.write().await.push_layer().delete(b"k:1");

	let read = queue.call(code(), H256::zero(), "read", b"k:2".to_vec(), Some(stack.clone())).await;
	assert_eq!(read.unwrap().output, b"b".to_vec());

	let keys = queue.call(code(), H256::zero(), "keys", b"k:".to_vec(), Some(stack)).await;
	assert_eq!(keys.unwrap().output, b"k:2".to_vec());
}

#[tokio::test]
async fn smoldot_engine_computes_state_roots() {
	let queue = ExecutionQueue::new(smoldot_engine_factory(ExecutorConfig::default()));
	let entries = vec![(b"key".to_vec(), b"value".to_vec())];

	let root = queue.state_root(entries.clone(), TrieVersion::V1).await.unwrap();
	assert_eq!(root, queue.state_root(entries, TrieVersion::V1).await.unwrap());
	assert_ne!(root, queue.state_root(vec![], TrieVersion::V1).await.unwrap());

	let updates = vec![(b"a".to_vec(), Some(b"1".to_vec()))];
	let output =
		queue.run(ExecutionTask::CreateProof { nodes: vec![], updates }, None).await.unwrap();
	let TaskOutput::Proof { root, nodes } = output else {
		panic!("expected a proof");
	};
	let entries = queue.decode_proof(root, nodes).await.unwrap();
	assert_eq!(entries, vec![(b"a".to_vec(), b"1".to_vec())]);
}
