use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
	CpuTime,
	MemoryUsage,
	ExecutionTime,
	ApiCalls,
	ConcurrentExecutions,
}

impl std::fmt::Display for LimitKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let name = match self {
			LimitKind::CpuTime => "cpu_time",
			LimitKind::MemoryUsage => "memory_usage",
			LimitKind::ExecutionTime => "execution_time",
			LimitKind::ApiCalls => "api_calls",
			LimitKind::ConcurrentExecutions => "concurrent_executions",
		};
		write!(f, "{}", name)
	}
}

const ALL_LIMIT_KINDS: [LimitKind; 5] = [
	LimitKind::CpuTime,
	LimitKind::MemoryUsage,
	LimitKind::ExecutionTime,
	LimitKind::ApiCalls,
	LimitKind::ConcurrentExecutions,
];

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
	Running,
	Completed,
	Failed,
	Timeout,
	Interrupted,
	LimitExceeded,
}

/// Soft and hard thresholds per limit kind. Soft violations log, hard
/// violations interrupt.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ResourceLimits {
	#[serde(default = "d_cpu_soft")]
	pub cpu_time_soft: f64,
	#[serde(default = "d_cpu_hard")]
	pub cpu_time_hard: f64,
	#[serde(default = "d_mem_soft")]
	pub memory_usage_soft: f64,
	#[serde(default = "d_mem_hard")]
	pub memory_usage_hard: f64,
	#[serde(default = "d_exec_soft")]
	pub execution_time_soft: f64,
	#[serde(default = "d_exec_hard")]
	pub execution_time_hard: f64,
	#[serde(default = "d_api_soft")]
	pub api_calls_soft: u64,
	#[serde(default = "d_api_hard")]
	pub api_calls_hard: u64,
	#[serde(default = "d_conc_soft")]
	pub concurrent_executions_soft: u64,
	#[serde(default = "d_conc_hard")]
	pub concurrent_executions_hard: u64,
}

fn d_cpu_soft() -> f64 {
	30.0
}
fn d_cpu_hard() -> f64 {
	60.0
}
fn d_mem_soft() -> f64 {
	512.0
}
fn d_mem_hard() -> f64 {
	1024.0
}
fn d_exec_soft() -> f64 {
	300.0
}
fn d_exec_hard() -> f64 {
	600.0
}
fn d_api_soft() -> u64 {
	100
}
fn d_api_hard() -> u64 {
	200
}
fn d_conc_soft() -> u64 {
	5
}
fn d_conc_hard() -> u64 {
	10
}

impl Default for ResourceLimits {
	fn default() -> Self {
		Self {
			cpu_time_soft: d_cpu_soft(),
			cpu_time_hard: d_cpu_hard(),
			memory_usage_soft: d_mem_soft(),
			memory_usage_hard: d_mem_hard(),
			execution_time_soft: d_exec_soft(),
			execution_time_hard: d_exec_hard(),
			api_calls_soft: d_api_soft(),
			api_calls_hard: d_api_hard(),
			concurrent_executions_soft: d_conc_soft(),
			concurrent_executions_hard: d_conc_hard(),
		}
	}
}

pub type InterruptHook = Arc<dyn Fn() + Send + Sync>;

/// One tracked tool invocation. Shared with the monitor task; only the
/// manager mutates it.
#[derive(Clone)]
pub struct ExecutionContext {
	pub execution_id: String,
	pub tool_id: String,
	pub user_id: String,
	pub start_time: DateTime<Utc>,
	pub end_time: Option<DateTime<Utc>>,
	pub status: ExecutionStatus,
	pub cpu_time: f64,
	pub memory_usage: f64,
	pub api_calls: u64,
	pub error_message: Option<String>,
	pub limits: ResourceLimits,
	pub interrupt_hook: Option<InterruptHook>,
}

/// Serializable view of an execution, hook elided.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionInfo {
	pub execution_id: String,
	pub tool_id: String,
	pub user_id: String,
	pub start_time: DateTime<Utc>,
	pub end_time: Option<DateTime<Utc>>,
	pub status: ExecutionStatus,
	pub cpu_time: f64,
	pub memory_usage: f64,
	pub api_calls: u64,
	pub error_message: Option<String>,
	pub limits: ResourceLimits,
}

impl From<&ExecutionContext> for ExecutionInfo {
	fn from(ctx: &ExecutionContext) -> Self {
		Self {
			execution_id: ctx.execution_id.clone(),
			tool_id: ctx.tool_id.clone(),
			user_id: ctx.user_id.clone(),
			start_time: ctx.start_time,
			end_time: ctx.end_time,
			status: ctx.status,
			cpu_time: ctx.cpu_time,
			memory_usage: ctx.memory_usage,
			api_calls: ctx.api_calls,
			error_message: ctx.error_message.clone(),
			limits: ctx.limits,
		}
	}
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerStatus {
	pub active_executions: usize,
	pub history_size: usize,
}

struct Inner {
	active: HashMap<String, ExecutionContext>,
	history: VecDeque<ExecutionContext>,
}

/// Active-execution registry with soft/hard limit evaluation and a
/// background interrupter.
pub struct ResourceLimitManager {
	inner: Mutex<Inner>,
	history_limit: usize,
	ct: CancellationToken,
}

impl Default for ResourceLimitManager {
	fn default() -> Self {
		Self::new(1000)
	}
}

impl ResourceLimitManager {
	pub fn new(history_limit: usize) -> Self {
		Self {
			inner: Mutex::new(Inner {
				active: HashMap::new(),
				history: VecDeque::new(),
			}),
			history_limit,
			ct: CancellationToken::new(),
		}
	}

	pub fn start_execution(
		&self,
		tool_id: &str,
		user_id: &str,
		limits: Option<ResourceLimits>,
		interrupt_hook: Option<InterruptHook>,
	) -> String {
		let execution_id = format!(
			"exec_{}",
			&uuid::Uuid::new_v4().simple().to_string()[..16]
		);
		let context = ExecutionContext {
			execution_id: execution_id.clone(),
			tool_id: tool_id.to_string(),
			user_id: user_id.to_string(),
			start_time: Utc::now(),
			end_time: None,
			status: ExecutionStatus::Running,
			cpu_time: 0.0,
			memory_usage: 0.0,
			api_calls: 0,
			error_message: None,
			limits: limits.unwrap_or_default(),
			interrupt_hook,
		};
		self.inner
			.lock()
			.unwrap()
			.active
			.insert(execution_id.clone(), context);
		info!(execution = %execution_id, tool = %tool_id, "started execution");
		execution_id
	}

	pub fn end_execution(
		&self,
		execution_id: &str,
		status: ExecutionStatus,
		error_message: Option<String>,
	) -> bool {
		let mut inner = self.inner.lock().unwrap();
		let Some(mut context) = inner.active.remove(execution_id) else {
			return false;
		};
		context.status = status;
		context.end_time = Some(Utc::now());
		context.error_message = error_message;
		inner.history.push_back(context);
		while inner.history.len() > self.history_limit {
			inner.history.pop_front();
		}
		info!(execution = %execution_id, ?status, "ended execution");
		true
	}

	pub fn update_metrics(
		&self,
		execution_id: &str,
		cpu_time: Option<f64>,
		memory_usage: Option<f64>,
		api_calls: Option<u64>,
	) -> bool {
		let mut inner = self.inner.lock().unwrap();
		match inner.active.get_mut(execution_id) {
			Some(context) => {
				if let Some(cpu_time) = cpu_time {
					context.cpu_time = cpu_time;
				}
				if let Some(memory_usage) = memory_usage {
					context.memory_usage = memory_usage;
				}
				if let Some(api_calls) = api_calls {
					context.api_calls = api_calls;
				}
				true
			},
			None => false,
		}
	}

	pub fn check_soft_limits(&self, execution_id: &str) -> HashMap<LimitKind, bool> {
		self.check_limits(execution_id, true)
	}

	pub fn check_hard_limits(&self, execution_id: &str) -> HashMap<LimitKind, bool> {
		self.check_limits(execution_id, false)
	}

	fn check_limits(&self, execution_id: &str, soft: bool) -> HashMap<LimitKind, bool> {
		let inner = self.inner.lock().unwrap();
		let Some(context) = inner.active.get(execution_id) else {
			return HashMap::new();
		};
		ALL_LIMIT_KINDS
			.iter()
			.map(|kind| (*kind, violates(context, &inner.active, *kind, soft)))
			.collect()
	}

	/// Interrupt a running execution: fire its hook (outcome irrelevant),
	/// mark it interrupted and migrate it to history.
	pub fn interrupt(&self, execution_id: &str, reason: &str) -> bool {
		let hook = {
			let inner = self.inner.lock().unwrap();
			match inner.active.get(execution_id) {
				Some(context) => context.interrupt_hook.clone(),
				None => return false,
			}
		};
		if let Some(hook) = hook {
			hook();
		}
		info!(execution = %execution_id, %reason, "interrupted execution");
		self.end_execution(
			execution_id,
			ExecutionStatus::Interrupted,
			Some(reason.to_string()),
		)
	}

	pub fn get(&self, execution_id: &str) -> Option<ExecutionInfo> {
		let inner = self.inner.lock().unwrap();
		inner
			.active
			.get(execution_id)
			.map(ExecutionInfo::from)
			.or_else(|| {
				inner
					.history
					.iter()
					.find(|ctx| ctx.execution_id == execution_id)
					.map(ExecutionInfo::from)
			})
	}

	pub fn list_active(&self, user_id: Option<&str>) -> Vec<ExecutionInfo> {
		let inner = self.inner.lock().unwrap();
		let mut executions: Vec<ExecutionInfo> = inner
			.active
			.values()
			.filter(|ctx| user_id.is_none_or(|u| ctx.user_id == u))
			.map(ExecutionInfo::from)
			.collect();
		executions.sort_by(|a, b| a.start_time.cmp(&b.start_time));
		executions
	}

	pub fn list_history(&self, user_id: Option<&str>, limit: usize) -> Vec<ExecutionInfo> {
		let inner = self.inner.lock().unwrap();
		inner
			.history
			.iter()
			.rev()
			.filter(|ctx| user_id.is_none_or(|u| ctx.user_id == u))
			.take(limit)
			.map(ExecutionInfo::from)
			.collect()
	}

	pub fn status(&self) -> ManagerStatus {
		let inner = self.inner.lock().unwrap();
		ManagerStatus {
			active_executions: inner.active.len(),
			history_size: inner.history.len(),
		}
	}

	/// Background interrupter: every second, hard violations interrupt the
	/// offending execution and soft violations are logged.
	pub fn spawn_monitor(self: &Arc<Self>) {
		let manager = self.clone();
		let ct = self.ct.clone();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
			loop {
				tokio::select! {
					_ = ticker.tick() => manager.enforce(),
					_ = ct.cancelled() => break,
				}
			}
		});
	}

	fn enforce(&self) {
		let ids: Vec<String> = {
			let inner = self.inner.lock().unwrap();
			inner.active.keys().cloned().collect()
		};
		for execution_id in ids {
			let hard = self.check_hard_limits(&execution_id);
			let violated: Vec<String> = hard
				.iter()
				.filter(|(_, exceeded)| **exceeded)
				.map(|(kind, _)| kind.to_string())
				.collect();
			if !violated.is_empty() {
				self.interrupt(
					&execution_id,
					&format!("hard limit exceeded: {}", violated.join(", ")),
				);
				continue;
			}
			let soft = self.check_soft_limits(&execution_id);
			let violated: Vec<String> = soft
				.iter()
				.filter(|(_, exceeded)| **exceeded)
				.map(|(kind, _)| kind.to_string())
				.collect();
			if !violated.is_empty() {
				warn!(execution = %execution_id, limits = %violated.join(", "), "soft limit exceeded");
			}
		}
	}

	pub fn shutdown(&self) {
		self.ct.cancel();
	}
}

fn violates(
	context: &ExecutionContext,
	active: &HashMap<String, ExecutionContext>,
	kind: LimitKind,
	soft: bool,
) -> bool {
	let limits = &context.limits;
	match kind {
		LimitKind::CpuTime => {
			let limit = if soft { limits.cpu_time_soft } else { limits.cpu_time_hard };
			context.cpu_time > limit
		},
		LimitKind::MemoryUsage => {
			let limit = if soft {
				limits.memory_usage_soft
			} else {
				limits.memory_usage_hard
			};
			context.memory_usage > limit
		},
		LimitKind::ExecutionTime => {
			let limit = if soft {
				limits.execution_time_soft
			} else {
				limits.execution_time_hard
			};
			let elapsed = (Utc::now() - context.start_time).num_milliseconds() as f64 / 1000.0;
			elapsed > limit
		},
		LimitKind::ApiCalls => {
			let limit = if soft { limits.api_calls_soft } else { limits.api_calls_hard };
			context.api_calls > limit
		},
		LimitKind::ConcurrentExecutions => {
			let limit = if soft {
				limits.concurrent_executions_soft
			} else {
				limits.concurrent_executions_hard
			};
			// Re-evaluated against the live active set on every check.
			let user_executions = active
				.values()
				.filter(|ctx| ctx.user_id == context.user_id)
				.count() as u64;
			user_executions > limit
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::sync::atomic::{AtomicBool, Ordering};

	#[test]
	fn executions_migrate_to_bounded_history() {
		let manager = ResourceLimitManager::new(2);
		for i in 0..3 {
			let id = manager.start_execution(&format!("tool-{}", i), "u1", None, None);
			assert!(manager.end_execution(&id, ExecutionStatus::Completed, None));
		}
		assert_eq!(manager.status().active_executions, 0);
		// Oldest record dropped on overflow.
		assert_eq!(manager.status().history_size, 2);
		let history = manager.list_history(None, 10);
		assert!(history.iter().all(|e| e.tool_id != "tool-0"));
	}

	#[test]
	fn metrics_updates_apply_only_to_active_executions() {
		let manager = ResourceLimitManager::default();
		let id = manager.start_execution("tool", "u1", None, None);
		assert!(manager.update_metrics(&id, Some(12.0), Some(256.0), Some(3)));
		let info = manager.get(&id).unwrap();
		assert_eq!(info.cpu_time, 12.0);
		assert_eq!(info.memory_usage, 256.0);
		assert_eq!(info.api_calls, 3);

		manager.end_execution(&id, ExecutionStatus::Completed, None);
		assert!(!manager.update_metrics(&id, Some(99.0), None, None));
	}

	#[test]
	fn soft_and_hard_limits_are_checked_separately() {
		let manager = ResourceLimitManager::default();
		let limits = ResourceLimits {
			cpu_time_soft: 10.0,
			cpu_time_hard: 20.0,
			..ResourceLimits::default()
		};
		let id = manager.start_execution("tool", "u1", Some(limits), None);
		manager.update_metrics(&id, Some(15.0), None, None);
		assert!(manager.check_soft_limits(&id)[&LimitKind::CpuTime]);
		assert!(!manager.check_hard_limits(&id)[&LimitKind::CpuTime]);
	}

	#[test]
	fn concurrent_executions_count_per_user() {
		let manager = ResourceLimitManager::default();
		let limits = ResourceLimits {
			concurrent_executions_soft: 1,
			concurrent_executions_hard: 2,
			..ResourceLimits::default()
		};
		let first = manager.start_execution("tool", "u1", Some(limits), None);
		assert!(!manager.check_soft_limits(&first)[&LimitKind::ConcurrentExecutions]);
		manager.start_execution("tool", "u1", Some(limits), None);
		manager.start_execution("tool", "u2", Some(limits), None);
		assert!(manager.check_soft_limits(&first)[&LimitKind::ConcurrentExecutions]);
		assert!(!manager.check_hard_limits(&first)[&LimitKind::ConcurrentExecutions]);
	}

	#[test]
	fn manual_interrupt_fires_the_hook_and_records_history() {
		let manager = ResourceLimitManager::default();
		let fired = Arc::new(AtomicBool::new(false));
		let hook_fired = fired.clone();
		let id = manager.start_execution(
			"tool",
			"u1",
			None,
			Some(Arc::new(move || hook_fired.store(true, Ordering::SeqCst))),
		);
		assert!(manager.interrupt(&id, "operator request"));
		assert!(fired.load(Ordering::SeqCst));
		let info = manager.get(&id).unwrap();
		assert_eq!(info.status, ExecutionStatus::Interrupted);
		assert_eq!(info.error_message.as_deref(), Some("operator request"));
	}

	#[tokio::test]
	async fn monitor_interrupts_hard_violations_within_two_seconds() {
		let manager = Arc::new(ResourceLimitManager::default());
		manager.spawn_monitor();

		let limits = ResourceLimits {
			cpu_time_soft: 10.0,
			cpu_time_hard: 20.0,
			..ResourceLimits::default()
		};
		let id = manager.start_execution("tool", "u1", Some(limits), None);
		manager.update_metrics(&id, Some(25.0), None, None);

		tokio::time::sleep(std::time::Duration::from_millis(1800)).await;
		let info = manager.get(&id).unwrap();
		assert_eq!(info.status, ExecutionStatus::Interrupted);
		assert!(manager.list_history(None, 10).iter().any(|e| e.execution_id == id));
		manager.shutdown();
	}
}
