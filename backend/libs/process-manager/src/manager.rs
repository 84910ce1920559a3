//! The saga interpreter.
//!
//! Walks a [`ProcessDefinition`](crate::graph::ProcessDefinition) over a
//! persisted instance: starts processes for initiation commands, consumes
//! `CommandCompleted` / `CommandFailed` replies correlated by process id,
//! retries failed steps per the definition, and compensates completed steps
//! in reverse order when a step fails for good. Every state change flows
//! through the append-only log; the instance row is the materialization.

use async_trait::async_trait;
use serde_json::{json, Value};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::ProcessError;
use crate::graph::ProcessDefinition;
use crate::model::{ProcessEvent, ProcessInstance, ProcessLogEntry, ProcessStatus};
use crate::store::ProcessStore;

use command_core::envelope::headers;
use command_core::executor::ProcessInitiator;
use command_core::{CommandBus, CommandStore, Envelope, ExecutionError, HandlerRegistry, InboxStore};

/// Manager tuning knobs.
#[derive(Debug, Clone)]
pub struct ProcessConfig {
    /// Cadence of the maintenance task (lease release, inbox cleanup)
    pub maintenance_interval: Duration,
    /// Inbox entries older than this are cleaned up
    pub inbox_retention: Duration,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            maintenance_interval: Duration::from_secs(5),
            inbox_retention: Duration::from_secs(7 * 86400),
        }
    }
}

impl ProcessConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            maintenance_interval: std::env::var("PROCESS_MAINTENANCE_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.maintenance_interval),
            inbox_retention: std::env::var("INBOX_RETENTION_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.inbox_retention),
        }
    }
}

pub struct ProcessManager {
    pool: PgPool,
    store: ProcessStore,
    definitions: HashMap<String, Arc<ProcessDefinition>>,
    by_initiation: HashMap<String, String>,
    bus: Arc<CommandBus>,
    commands: Arc<CommandStore>,
    inbox: Arc<InboxStore>,
    config: ProcessConfig,
}

impl ProcessManager {
    pub fn new(
        pool: PgPool,
        store: ProcessStore,
        bus: Arc<CommandBus>,
        commands: Arc<CommandStore>,
        inbox: Arc<InboxStore>,
        config: ProcessConfig,
    ) -> Self {
        Self {
            pool,
            store,
            definitions: HashMap::new(),
            by_initiation: HashMap::new(),
            bus,
            commands,
            inbox,
            config,
        }
    }

    /// Register a process definition.
    pub fn register(&mut self, definition: ProcessDefinition) {
        self.by_initiation.insert(
            definition.initiation_command().to_string(),
            definition.process_type().to_string(),
        );
        info!(
            process_type = definition.process_type(),
            initiation_command = definition.initiation_command(),
            steps = definition.steps().len(),
            "Process definition registered"
        );
        self.definitions.insert(
            definition.process_type().to_string(),
            Arc::new(definition),
        );
    }

    /// Declare every registered definition's initiation command on the
    /// handler registry, so the executor routes those commands here.
    pub fn declare_initiations(&self, registry: &mut HandlerRegistry) {
        for name in self.by_initiation.keys() {
            registry.register_initiation(name.clone());
        }
    }

    /// Start a process outside an existing transaction.
    pub async fn start_process(
        &self,
        process_type: &str,
        business_key: &str,
        initial_data: Value,
    ) -> Result<Uuid, ProcessError> {
        let mut tx = self.pool.begin().await?;
        let process_id = self
            .start_process_in(&mut tx, process_type, business_key, initial_data, None)
            .await?;
        tx.commit().await?;
        Ok(process_id)
    }

    /// Start a process inside the caller's transaction (the executor calls
    /// this for initiation commands, so instance, log, and first step
    /// command commit atomically).
    pub async fn start_process_in(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        process_type: &str,
        business_key: &str,
        initial_data: Value,
        causation: Option<Uuid>,
    ) -> Result<Uuid, ProcessError> {
        let def = self
            .definitions
            .get(process_type)
            .cloned()
            .ok_or_else(|| ProcessError::UnknownProcessType(process_type.to_string()))?;

        if self
            .store
            .find_live_by_key(tx, process_type, business_key)
            .await?
            .is_some()
        {
            return Err(ProcessError::AlreadyRunning {
                process_type: process_type.to_string(),
                business_key: business_key.to_string(),
            });
        }

        let process_id = Uuid::new_v4();
        let mut instance = ProcessInstance::new(process_id, process_type, business_key);

        let started = ProcessEvent::ProcessStarted {
            process_type: process_type.to_string(),
            business_key: business_key.to_string(),
            initial_data,
        };
        self.store.append_event(tx, process_id, &started).await?;
        instance.apply(&started);

        let first = def.first_step().name.clone();
        let command_id = self.emit_step(tx, &instance, &first, 0, causation).await?;
        let scheduled = ProcessEvent::StepScheduled {
            step: first.clone(),
            command_id,
            attempt: 0,
        };
        self.store.append_event(tx, process_id, &scheduled).await?;
        instance.apply(&scheduled);

        self.store.insert_instance(tx, &instance).await?;

        info!(
            process_id = %process_id,
            process_type = %process_type,
            business_key = %business_key,
            first_step = %first,
            "Process started"
        );
        Ok(process_id)
    }

    /// Ingest a `CommandCompleted` / `CommandFailed` reply envelope.
    ///
    /// Correlation: the reply's `correlationId` is the process id, and the
    /// `commandId` must match the latest scheduled command in the log;
    /// stale duplicates and foreign replies are ignored.
    pub async fn handle_reply(&self, env: &Envelope) -> Result<(), ProcessError> {
        let Ok(process_id) = Uuid::parse_str(&env.correlation_id) else {
            debug!(correlation_id = %env.correlation_id, "Correlation is not a process id, ignoring");
            return Ok(());
        };
        let Some(reply_command_id) = env.command_id else {
            debug!(%process_id, "Reply without commandId, ignoring");
            return Ok(());
        };
        let succeeded = env.name == "CommandCompleted";

        let mut tx = self.pool.begin().await?;

        let Some(mut instance) = self.store.find_for_update(&mut tx, process_id).await? else {
            debug!(%process_id, "No process for correlation, ignoring reply");
            return Ok(());
        };
        if instance.is_terminal() {
            debug!(%process_id, status = instance.status.as_str(), "Process already ended, ignoring reply");
            return Ok(());
        }
        if instance.status == ProcessStatus::Paused {
            warn!(%process_id, "Reply while paused; resume will re-emit the step");
            return Ok(());
        }

        let def = self
            .definitions
            .get(&instance.process_type)
            .cloned()
            .ok_or_else(|| ProcessError::UnknownProcessType(instance.process_type.clone()))?;
        let log = self.store.load_log_in(&mut tx, process_id).await?;

        let expected = log.iter().rev().find_map(|entry| match &entry.event {
            ProcessEvent::StepScheduled { command_id, .. }
            | ProcessEvent::CompensationScheduled { command_id, .. } => Some(*command_id),
            _ => None,
        });
        if expected != Some(reply_command_id) {
            debug!(
                %process_id,
                reply_command_id = %reply_command_id,
                "Stale or foreign reply, ignoring"
            );
            return Ok(());
        }

        let error = env
            .payload
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("step failed")
            .to_string();

        if instance.status == ProcessStatus::Compensating {
            self.advance_compensation(&mut tx, &def, &mut instance, &log, succeeded, &error)
                .await?;
        } else {
            self.advance_step(
                &mut tx,
                &def,
                &mut instance,
                &log,
                succeeded,
                env.payload.clone(),
                &error,
            )
            .await?;
        }

        self.store.update_instance(&mut tx, &instance).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn advance_step(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        def: &ProcessDefinition,
        instance: &mut ProcessInstance,
        log: &[ProcessLogEntry],
        succeeded: bool,
        payload: Value,
        error: &str,
    ) -> Result<(), ProcessError> {
        let Some((index, step)) = def.step(&instance.current_step) else {
            return Err(ProcessError::UnknownStep(instance.current_step.clone()));
        };
        let step_name = step.name.clone();

        if succeeded {
            self.record(
                tx,
                instance,
                ProcessEvent::StepCompleted {
                    step: step_name.clone(),
                    data: payload,
                },
            )
            .await?;

            match def.next_after(index, &instance.data)? {
                Some(next) => {
                    let next_name = next.name.clone();
                    let command_id = self.emit_step(tx, instance, &next_name, 0, None).await?;
                    self.record(
                        tx,
                        instance,
                        ProcessEvent::StepScheduled {
                            step: next_name.clone(),
                            command_id,
                            attempt: 0,
                        },
                    )
                    .await?;
                    debug!(
                        process_id = %instance.process_id,
                        completed = %step_name,
                        next = %next_name,
                        "Step completed, next scheduled"
                    );
                }
                None => {
                    self.record(
                        tx,
                        instance,
                        ProcessEvent::ProcessEnded {
                            status: ProcessStatus::Succeeded,
                        },
                    )
                    .await?;
                    info!(process_id = %instance.process_id, "Process succeeded");
                }
            }
            return Ok(());
        }

        let attempts_used = instance.retries.max(0) as u32;
        if def.is_retryable(step, error) && attempts_used < def.max_retries(step) {
            self.record(
                tx,
                instance,
                ProcessEvent::StepFailed {
                    step: step_name.clone(),
                    error: error.to_string(),
                    retrying: true,
                },
            )
            .await?;

            // idempotency is per command, not per step: a fresh attempt gets
            // a fresh command id
            let attempt = instance.retries + 1;
            let command_id = self.emit_step(tx, instance, &step_name, attempt, None).await?;
            self.record(
                tx,
                instance,
                ProcessEvent::StepScheduled {
                    step: step_name.clone(),
                    command_id,
                    attempt,
                },
            )
            .await?;
            warn!(
                process_id = %instance.process_id,
                step = %step_name,
                attempt,
                error = %error,
                "Step failed, retrying"
            );
        } else {
            self.record(
                tx,
                instance,
                ProcessEvent::StepFailed {
                    step: step_name.clone(),
                    error: error.to_string(),
                    retrying: false,
                },
            )
            .await?;
            warn!(
                process_id = %instance.process_id,
                step = %step_name,
                error = %error,
                "Step failed permanently"
            );
            self.begin_compensation(tx, def, instance, log).await?;
        }
        Ok(())
    }

    async fn begin_compensation(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        def: &ProcessDefinition,
        instance: &mut ProcessInstance,
        log: &[ProcessLogEntry],
    ) -> Result<(), ProcessError> {
        match pending_compensations(def, log).first() {
            None => {
                self.record(
                    tx,
                    instance,
                    ProcessEvent::ProcessEnded {
                        status: ProcessStatus::Failed,
                    },
                )
                .await?;
                warn!(process_id = %instance.process_id, "Nothing to compensate, process failed");
            }
            Some((step_name, compensation)) => {
                let command_id = self.emit_compensation(tx, instance, compensation).await?;
                self.record(
                    tx,
                    instance,
                    ProcessEvent::CompensationScheduled {
                        step: step_name.clone(),
                        compensation: compensation.clone(),
                        command_id,
                    },
                )
                .await?;
                info!(
                    process_id = %instance.process_id,
                    step = %step_name,
                    compensation = %compensation,
                    "Compensation started"
                );
            }
        }
        Ok(())
    }

    async fn advance_compensation(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        def: &ProcessDefinition,
        instance: &mut ProcessInstance,
        log: &[ProcessLogEntry],
        succeeded: bool,
        error: &str,
    ) -> Result<(), ProcessError> {
        let Some((step_name, compensation)) = log.iter().rev().find_map(|entry| {
            match &entry.event {
                ProcessEvent::CompensationScheduled {
                    step, compensation, ..
                } => Some((step.clone(), compensation.clone())),
                _ => None,
            }
        }) else {
            return Err(ProcessError::UnknownStep(instance.current_step.clone()));
        };

        if !succeeded {
            // a failed compensation is not retried; the process parks FAILED
            self.record(
                tx,
                instance,
                ProcessEvent::CompensationFailed {
                    step: step_name.clone(),
                    compensation,
                    error: error.to_string(),
                },
            )
            .await?;
            self.record(
                tx,
                instance,
                ProcessEvent::ProcessEnded {
                    status: ProcessStatus::Failed,
                },
            )
            .await?;
            error!(
                process_id = %instance.process_id,
                step = %step_name,
                error = %error,
                "Compensation failed, process failed"
            );
            return Ok(());
        }

        self.record(
            tx,
            instance,
            ProcessEvent::CompensationCompleted {
                step: step_name.clone(),
                compensation,
            },
        )
        .await?;

        match pending_compensations(def, log).first() {
            Some((next_step, next_comp)) => {
                let command_id = self.emit_compensation(tx, instance, next_comp).await?;
                self.record(
                    tx,
                    instance,
                    ProcessEvent::CompensationScheduled {
                        step: next_step.clone(),
                        compensation: next_comp.clone(),
                        command_id,
                    },
                )
                .await?;
            }
            None => {
                self.record(
                    tx,
                    instance,
                    ProcessEvent::ProcessEnded {
                        status: ProcessStatus::Compensated,
                    },
                )
                .await?;
                info!(process_id = %instance.process_id, "Process compensated");
            }
        }
        Ok(())
    }

    /// Operator surface: park a live process until `resume`.
    pub async fn pause(&self, process_id: Uuid) -> Result<(), ProcessError> {
        let mut tx = self.pool.begin().await?;
        let mut instance = self
            .store
            .find_for_update(&mut tx, process_id)
            .await?
            .ok_or(ProcessError::NotFound(process_id))?;

        if instance.is_terminal() {
            return Err(ProcessError::InvalidState {
                process_id,
                status: instance.status.as_str().to_string(),
                operation: "pause",
            });
        }

        self.record(&mut tx, &mut instance, ProcessEvent::ProcessPaused)
            .await?;
        self.store.update_instance(&mut tx, &instance).await?;
        tx.commit().await?;

        warn!(%process_id, "Process paused");
        Ok(())
    }

    /// Operator surface: return a paused process to work by re-emitting its
    /// current step (or compensation) with a fresh command id.
    pub async fn resume(&self, process_id: Uuid) -> Result<(), ProcessError> {
        let mut tx = self.pool.begin().await?;
        let mut instance = self
            .store
            .find_for_update(&mut tx, process_id)
            .await?
            .ok_or(ProcessError::NotFound(process_id))?;

        if instance.status != ProcessStatus::Paused {
            return Err(ProcessError::InvalidState {
                process_id,
                status: instance.status.as_str().to_string(),
                operation: "resume",
            });
        }

        let def = self
            .definitions
            .get(&instance.process_type)
            .cloned()
            .ok_or_else(|| ProcessError::UnknownProcessType(instance.process_type.clone()))?;

        self.record(&mut tx, &mut instance, ProcessEvent::ProcessResumed)
            .await?;

        let current = instance.current_step.clone();
        if def.step(&current).is_some() {
            let attempt = instance.retries + 1;
            let command_id = self.emit_step(&mut tx, &instance, &current, attempt, None).await?;
            self.record(
                &mut tx,
                &mut instance,
                ProcessEvent::StepScheduled {
                    step: current,
                    command_id,
                    attempt,
                },
            )
            .await?;
        } else if let Some(step) = def.step_for_compensation(&current) {
            let step_name = step.name.clone();
            let command_id = self.emit_compensation(&mut tx, &instance, &current).await?;
            self.record(
                &mut tx,
                &mut instance,
                ProcessEvent::CompensationScheduled {
                    step: step_name,
                    compensation: current,
                    command_id,
                },
            )
            .await?;
        } else {
            return Err(ProcessError::UnknownStep(current));
        }

        self.store.update_instance(&mut tx, &instance).await?;
        tx.commit().await?;

        info!(%process_id, "Process resumed");
        Ok(())
    }

    /// Replay the log into a fresh instance; by construction this equals
    /// the stored materialization.
    pub async fn rebuild(
        &self,
        process_id: Uuid,
    ) -> Result<Option<ProcessInstance>, ProcessError> {
        let log = self.store.load_log(process_id).await?;
        Ok(crate::model::rebuild_from_log(process_id, &log))
    }

    /// Maintenance cadence: release expired command leases every tick and
    /// clean old inbox entries hourly. Spawn as a background task.
    pub async fn run_maintenance(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.config.maintenance_interval.as_millis() as u64,
            "Process maintenance starting"
        );

        let mut ticker = tokio::time::interval(self.config.maintenance_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_cleanup = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.commands.release_expired_leases().await {
                        Ok(released) if released > 0 => {
                            warn!(released, "Expired command leases released");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = ?e, "Lease release failed"),
                    }

                    if last_cleanup.elapsed() >= Duration::from_secs(3600) {
                        last_cleanup = tokio::time::Instant::now();
                        if let Err(e) = self.inbox.cleanup_older_than(self.config.inbox_retention).await {
                            error!(error = ?e, "Inbox cleanup failed");
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Process maintenance stopping");
                        break;
                    }
                }
            }
        }
    }

    async fn record(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        instance: &mut ProcessInstance,
        event: ProcessEvent,
    ) -> Result<(), ProcessError> {
        self.store
            .append_event(tx, instance.process_id, &event)
            .await?;
        instance.apply(&event);
        Ok(())
    }

    async fn emit_step(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        instance: &ProcessInstance,
        step_name: &str,
        attempt: i32,
        causation: Option<Uuid>,
    ) -> Result<Uuid, ProcessError> {
        let idempotency_key = format!("{}:{}:{}", instance.process_id, step_name, attempt);
        // (name, business_key) is unique across all commands ever, so a
        // retried attempt carries a suffixed key
        let business_key = if attempt == 0 {
            instance.business_key.clone()
        } else {
            format!("{}:r{attempt}", instance.business_key)
        };

        let mut reply_headers = BTreeMap::new();
        reply_headers.insert(
            headers::CORRELATION_ID.to_string(),
            instance.process_id.to_string(),
        );
        if let Some(causation) = causation {
            reply_headers.insert(headers::CAUSATION_ID.to_string(), causation.to_string());
        }

        let (command_id, _outbox_id) = self
            .bus
            .accept_in(
                tx,
                step_name,
                &idempotency_key,
                &business_key,
                instance.data.clone(),
                &reply_headers,
            )
            .await?;

        debug!(
            process_id = %instance.process_id,
            step = %step_name,
            command_id = %command_id,
            attempt,
            "Step command emitted"
        );
        Ok(command_id)
    }

    async fn emit_compensation(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        instance: &ProcessInstance,
        compensation: &str,
    ) -> Result<Uuid, ProcessError> {
        let idempotency_key = format!("{}:comp:{compensation}", instance.process_id);

        let mut reply_headers = BTreeMap::new();
        reply_headers.insert(
            headers::CORRELATION_ID.to_string(),
            instance.process_id.to_string(),
        );

        let (command_id, _outbox_id) = self
            .bus
            .accept_in(
                tx,
                compensation,
                &idempotency_key,
                &instance.business_key,
                instance.data.clone(),
                &reply_headers,
            )
            .await?;

        debug!(
            process_id = %instance.process_id,
            compensation = %compensation,
            command_id = %command_id,
            "Compensation command emitted"
        );
        Ok(command_id)
    }
}

/// Completed steps with a compensation that has not been scheduled yet,
/// most recently completed first (reverse traversal order).
fn pending_compensations(
    def: &ProcessDefinition,
    log: &[ProcessLogEntry],
) -> Vec<(String, String)> {
    let mut completed: Vec<String> = Vec::new();
    let mut scheduled: HashSet<String> = HashSet::new();

    for entry in log {
        match &entry.event {
            ProcessEvent::StepCompleted { step, .. } => {
                if !completed.contains(step) {
                    completed.push(step.clone());
                }
            }
            ProcessEvent::CompensationScheduled { step, .. } => {
                scheduled.insert(step.clone());
            }
            _ => {}
        }
    }

    completed
        .iter()
        .rev()
        .filter(|step| !scheduled.contains(*step))
        .filter_map(|step| {
            def.step(step)
                .and_then(|(_, record)| record.compensation.clone())
                .map(|compensation| (step.clone(), compensation))
        })
        .collect()
}

/// The executor delegates initiation commands here: the new instance, its
/// log entries, and the first step command all commit inside the
/// executor's transaction. Failures map to `ProcessStartFailed`, which the
/// executor treats as permanent.
#[async_trait]
impl ProcessInitiator for ProcessManager {
    async fn start(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        env: &Envelope,
    ) -> Result<Value, ExecutionError> {
        let process_type = self
            .by_initiation
            .get(&env.name)
            .cloned()
            .ok_or_else(|| {
                ExecutionError::ProcessStartFailed(format!(
                    "'{}' does not initiate a process",
                    env.name
                ))
            })?;
        let business_key = env
            .business_key()
            .ok_or_else(|| {
                ExecutionError::ProcessStartFailed("missing businessKey header".to_string())
            })?
            .to_string();

        let process_id = self
            .start_process_in(tx, &process_type, &business_key, env.payload.clone(), env.command_id)
            .await
            .map_err(|e| ExecutionError::ProcessStartFailed(e.to_string()))?;

        Ok(json!({
            "processId": process_id,
            "processType": process_type,
            "status": "STARTED",
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::ProcessDefinition;
    use chrono::Utc;

    fn entry(seq: i64, event: ProcessEvent) -> ProcessLogEntry {
        ProcessLogEntry {
            seq,
            at: Utc::now(),
            event,
        }
    }

    fn definition() -> ProcessDefinition {
        ProcessDefinition::builder("SimplePayment", "SubmitPayment")
            .predicate("requiresFx", |data| {
                data.get("requiresFx").and_then(Value::as_bool).unwrap_or(false)
            })
            .start_with("BookLimits")
            .with_compensation("ReverseLimits")
            .then_if("requiresFx")
            .when_true("BookFx")
            .with_compensation("UnwindFx")
            .then("CreateTransaction")
            .with_compensation("ReverseTransaction")
            .then("CreatePayment")
            .end()
            .unwrap()
    }

    #[test]
    fn test_pending_compensations_reverse_order() {
        let def = definition();
        let log = vec![
            entry(
                1,
                ProcessEvent::StepCompleted {
                    step: "BookLimits".to_string(),
                    data: Value::Null,
                },
            ),
            entry(
                2,
                ProcessEvent::StepCompleted {
                    step: "BookFx".to_string(),
                    data: Value::Null,
                },
            ),
            entry(
                3,
                ProcessEvent::StepFailed {
                    step: "CreateTransaction".to_string(),
                    error: "boom".to_string(),
                    retrying: false,
                },
            ),
        ];

        let pending = pending_compensations(&def, &log);
        assert_eq!(
            pending,
            vec![
                ("BookFx".to_string(), "UnwindFx".to_string()),
                ("BookLimits".to_string(), "ReverseLimits".to_string()),
            ]
        );
    }

    #[test]
    fn test_pending_compensations_skips_scheduled() {
        let def = definition();
        let log = vec![
            entry(
                1,
                ProcessEvent::StepCompleted {
                    step: "BookLimits".to_string(),
                    data: Value::Null,
                },
            ),
            entry(
                2,
                ProcessEvent::StepCompleted {
                    step: "BookFx".to_string(),
                    data: Value::Null,
                },
            ),
            entry(
                3,
                ProcessEvent::CompensationScheduled {
                    step: "BookFx".to_string(),
                    compensation: "UnwindFx".to_string(),
                    command_id: Uuid::new_v4(),
                },
            ),
        ];

        let pending = pending_compensations(&def, &log);
        assert_eq!(
            pending,
            vec![("BookLimits".to_string(), "ReverseLimits".to_string())]
        );
    }

    #[test]
    fn test_steps_without_compensation_are_not_compensated() {
        let def = definition();
        let log = vec![entry(
            1,
            ProcessEvent::StepCompleted {
                step: "CreatePayment".to_string(),
                data: Value::Null,
            },
        )];
        assert!(pending_compensations(&def, &log).is_empty());
    }
}
