// SPDX-License-Identifier: GPL-3.0

//! Single-flight execution queue.
//!
//! Tasks run strictly in submission order, one at a time, on a dedicated worker thread.
//! The engine is not `Send` and may block for a long time, so it never runs on the async
//! runtime; the dispatcher task only shuttles tasks, storage requests and results.

use super::{
	EngineFactory, ExecutionTask, HostStorage, RuntimeCallResult, RuntimeEngine, RuntimeVersion,
	TaskOutput, TrieVersion,
};
use crate::{
	error::{ExecutorError, StorageError},
	storage::{StorageStack, StorageValue},
	strings::executor::{HOST_CHANNEL_CAPACITY, targets, threads},
};
use log::{debug, trace, warn};
use scale::Decode;
use std::{
	panic::{AssertUnwindSafe, catch_unwind},
	sync::{Arc, mpsc as std_mpsc},
	thread,
};
use subxt::config::substrate::H256;
use tokio::sync::{RwLock, mpsc, oneshot};

/// The storage a task reads from: the stack of the block that submitted it.
pub type TaskStorage = Option<Arc<RwLock<StorageStack>>>;

type TaskResult = Result<TaskOutput, ExecutorError>;
type Completion = Box<dyn FnOnce(TaskResult) + Send>;

struct Job {
	task: ExecutionTask,
	storage: TaskStorage,
	on_complete: Completion,
}

/// A storage read issued by the engine mid-task.
enum HostRequest {
	Get { key: Vec<u8>, reply: oneshot::Sender<Result<Option<Vec<u8>>, StorageError>> },
	NextKey {
		prefix: Vec<u8>,
		key: Vec<u8>,
		reply: oneshot::Sender<Result<Option<Vec<u8>>, StorageError>>,
	},
}

struct WorkerRequest {
	task: ExecutionTask,
	host: mpsc::Sender<HostRequest>,
	result: oneshot::Sender<TaskResult>,
}

/// FIFO of [`ExecutionTask`]s in front of one engine worker.
///
/// Cloning the queue yields another handle to the same FIFO. Independent queues share
/// nothing. The dispatcher stops once every handle is dropped.
///
/// # Example
///
/// ```ignore
/// let queue = ExecutionQueue::new(smoldot_engine_factory(ExecutorConfig::default()));
/// let version = queue.runtime_version(code).await?;
/// let result = queue.call(code, block_hash, "Core_version", vec![], Some(storage)).await?;
/// ```
#[derive(Clone)]
pub struct ExecutionQueue {
	jobs: mpsc::UnboundedSender<Job>,
}

impl std::fmt::Debug for ExecutionQueue {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ExecutionQueue").field("closed", &self.jobs.is_closed()).finish()
	}
}

impl ExecutionQueue {
	/// Create a queue whose workers run engines built by `factory`.
	///
	/// Must be called from within a Tokio runtime; the dispatcher is spawned onto it.
	pub fn new(factory: EngineFactory) -> Self {
		let (jobs, receiver) = mpsc::unbounded_channel();
		tokio::spawn(dispatch(receiver, factory));
		Self { jobs }
	}

	/// Append a task to the queue.
	///
	/// `on_complete` is invoked exactly once with the task's outcome, from the dispatcher.
	/// If the queue is closed it is invoked immediately with [`ExecutorError::QueueClosed`].
	///
	/// # Arguments
	///
	/// * `task` - The task to run.
	/// * `storage` - The stack answering the engine's storage reads. Reads resolve to no
	///   value when `None`.
	/// * `on_complete` - Receives the task's outcome.
	pub fn add_and_run_task(
		&self,
		task: ExecutionTask,
		storage: TaskStorage,
		on_complete: impl FnOnce(TaskResult) + Send + 'static,
	) {
		trace!(target: targets::QUEUE, "Enqueueing {} task", task.kind());
		let job = Job { task, storage, on_complete: Box::new(on_complete) };
		if let Err(mpsc::error::SendError(job)) = self.jobs.send(job) {
			(job.on_complete)(Err(ExecutorError::QueueClosed));
		}
	}

	/// Append a task and wait for its outcome.
	pub async fn run(&self, task: ExecutionTask, storage: TaskStorage) -> TaskResult {
		let (sender, receiver) = oneshot::channel();
		self.add_and_run_task(task, storage, move |result| {
			let _ = sender.send(result);
		});
		receiver.await.map_err(|_| ExecutorError::QueueClosed)?
	}

	/// Version of the runtime `code`.
	pub async fn runtime_version(&self, code: Arc<[u8]>) -> Result<RuntimeVersion, ExecutorError> {
		match self.run(ExecutionTask::RuntimeVersion { code }, None).await? {
			TaskOutput::RuntimeVersion(version) => Ok(version),
			_ => Err(ExecutorError::UnexpectedOutput { expected: "RuntimeVersion" }),
		}
	}

	/// SCALE-encoded metadata of the runtime `code`, without the length prefix
	/// `Metadata_metadata` wraps it in.
	pub async fn metadata(
		&self,
		code: Arc<[u8]>,
		storage: TaskStorage,
	) -> Result<Vec<u8>, ExecutorError> {
		match self.run(ExecutionTask::Metadata { code }, storage).await? {
			TaskOutput::Metadata(output) => Vec::<u8>::decode(&mut output.as_slice())
				.map_err(|e| ExecutorError::RuntimeError {
					method: "Metadata_metadata".to_string(),
					message: e.to_string(),
				}),
			_ => Err(ExecutorError::UnexpectedOutput { expected: "Metadata" }),
		}
	}

	/// Run a single runtime call on top of `block_hash`.
	pub async fn call(
		&self,
		code: Arc<[u8]>,
		block_hash: H256,
		method: &str,
		args: Vec<u8>,
		storage: TaskStorage,
	) -> Result<RuntimeCallResult, ExecutorError> {
		let calls = vec![(method.to_string(), args)];
		match self.run(ExecutionTask::Call { code, block_hash, calls }, storage).await? {
			TaskOutput::Call(result) => Ok(result),
			_ => Err(ExecutorError::UnexpectedOutput { expected: "Call" }),
		}
	}

	/// Root of a trie holding `entries`.
	pub async fn state_root(
		&self,
		entries: Vec<(Vec<u8>, Vec<u8>)>,
		version: TrieVersion,
	) -> Result<H256, ExecutorError> {
		match self.run(ExecutionTask::StateRoot { entries, version }, None).await? {
			TaskOutput::StateRoot(root) => Ok(root),
			_ => Err(ExecutorError::UnexpectedOutput { expected: "StateRoot" }),
		}
	}

	/// Apply `updates` to the trie of a proof. Returns the new root and proof nodes.
	pub async fn create_proof(
		&self,
		nodes: Vec<Vec<u8>>,
		updates: Vec<(Vec<u8>, Option<Vec<u8>>)>,
	) -> Result<(H256, Vec<Vec<u8>>), ExecutorError> {
		match self.run(ExecutionTask::CreateProof { nodes, updates }, None).await? {
			TaskOutput::Proof { root, nodes } => Ok((root, nodes)),
			_ => Err(ExecutorError::UnexpectedOutput { expected: "Proof" }),
		}
	}

	/// Entries of the trie rooted at `root` contained in a proof.
	pub async fn decode_proof(
		&self,
		root: H256,
		nodes: Vec<Vec<u8>>,
	) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ExecutorError> {
		match self.run(ExecutionTask::DecodeProof { root, nodes }, None).await? {
			TaskOutput::Entries(entries) => Ok(entries),
			_ => Err(ExecutorError::UnexpectedOutput { expected: "Entries" }),
		}
	}
}

/// Runs jobs one at a time, provisioning a worker whenever none is alive.
async fn dispatch(mut jobs: mpsc::UnboundedReceiver<Job>, factory: EngineFactory) {
	let mut worker: Option<Worker> = None;
	while let Some(job) = jobs.recv().await {
		let kind = job.task.kind();
		let current = match worker.take() {
			Some(current) => current,
			None => match Worker::spawn(factory.clone()) {
				Ok(spawned) => spawned,
				Err(err) => {
					warn!(target: targets::QUEUE, "Failed to provision executor worker: {err}");
					complete(job.on_complete, Err(err));
					continue;
				},
			},
		};

		let (result, alive) = current.run(job.task, job.storage).await;
		if alive {
			worker = Some(current);
		} else {
			warn!(target: targets::QUEUE, "Executor worker lost while running {kind} task");
		}
		debug!(target: targets::QUEUE, "{kind} task done (ok: {})", result.is_ok());
		complete(job.on_complete, result);
	}
	trace!(target: targets::QUEUE, "Execution queue closed");
}

fn complete(on_complete: Completion, result: TaskResult) {
	if catch_unwind(AssertUnwindSafe(move || on_complete(result))).is_err() {
		warn!(target: targets::QUEUE, "Task completion callback panicked");
	}
}

/// Handle to the worker thread.
struct Worker {
	requests: std_mpsc::Sender<WorkerRequest>,
}

impl Worker {
	fn spawn(factory: EngineFactory) -> Result<Self, ExecutorError> {
		let (requests, receiver) = std_mpsc::channel::<WorkerRequest>();
		thread::Builder::new()
			.name(threads::WORKER.to_string())
			.spawn(move || {
				let mut engine = factory();
				while let Ok(request) = receiver.recv() {
					serve_task(engine.as_mut(), request);
				}
			})
			.map_err(|e| ExecutorError::WorkerUnavailable { message: e.to_string() })?;
		Ok(Self { requests })
	}

	/// Run a task, answering its storage requests from `storage`.
	///
	/// Returns the outcome and whether the worker survived.
	async fn run(&self, task: ExecutionTask, storage: TaskStorage) -> (TaskResult, bool) {
		let (host, mut host_requests) = mpsc::channel(HOST_CHANNEL_CAPACITY);
		let (result, mut outcome) = oneshot::channel();
		if self.requests.send(WorkerRequest { task, host, result }).is_err() {
			let message = "worker thread exited".to_string();
			return (Err(ExecutorError::WorkerUnavailable { message }), false);
		}

		loop {
			tokio::select! {
				biased;
				Some(request) = host_requests.recv() => answer(request, storage.as_ref()).await,
				result = &mut outcome => return match result {
					Ok(result) => (result, true),
					Err(_) => {
						let message = "worker thread stopped mid-task".to_string();
						(Err(ExecutorError::WorkerUnavailable { message }), false)
					},
				},
			}
		}
	}
}

fn serve_task(engine: &mut dyn RuntimeEngine, request: WorkerRequest) {
	let WorkerRequest { task, host, result } = request;
	let mut host = ChannelHost { requests: host };
	let outcome = engine.execute(task, &mut host);
	let _ = result.send(outcome);
}

async fn answer(request: HostRequest, storage: Option<&Arc<RwLock<StorageStack>>>) {
	match request {
		HostRequest::Get { key, reply } => {
			let value = match storage {
				Some(stack) => stack
					.read()
					.await
					.get(&key, false)
					.await
					.map(|value| value.and_then(StorageValue::into_value)),
				None => Ok(None),
			};
			let _ = reply.send(value);
		},
		HostRequest::NextKey { prefix, key, reply } => {
			let next = match storage {
				Some(stack) => stack.read().await.next_key(&prefix, &key).await,
				None => Ok(None),
			};
			let _ = reply.send(next);
		},
	}
}

/// [`HostStorage`] for the worker side: each read is a round trip to the dispatcher.
struct ChannelHost {
	requests: mpsc::Sender<HostRequest>,
}

impl ChannelHost {
	fn request(
		&self,
		key: &[u8],
		build: impl FnOnce(oneshot::Sender<Result<Option<Vec<u8>>, StorageError>>) -> HostRequest,
	) -> Result<Option<Vec<u8>>, ExecutorError> {
		let (reply, answer) = oneshot::channel();
		let unavailable =
			|| ExecutorError::WorkerUnavailable { message: "dispatcher dropped the task".into() };
		self.requests.blocking_send(build(reply)).map_err(|_| unavailable())?;
		answer.blocking_recv().map_err(|_| unavailable())?.map_err(|e| {
			ExecutorError::StorageError { key: hex::encode(key), message: e.to_string() }
		})
	}
}

impl HostStorage for ChannelHost {
	fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, ExecutorError> {
		self.request(key, |reply| HostRequest::Get { key: key.to_vec(), reply })
	}

	fn next_key(&mut self, prefix: &[u8], key: &[u8]) -> Result<Option<Vec<u8>>, ExecutorError> {
		self.request(key, |reply| HostRequest::NextKey {
			prefix: prefix.to_vec(),
			key: key.to_vec(),
			reply,
		})
	}
}
