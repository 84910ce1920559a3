//! Process graphs and the builder DSL.
//!
//! A process is an indexed vector of step records. Each step names its
//! command type, an optional compensation command type, and an optional
//! entry condition (the conditional-edge record): traversal walks the
//! vector forward, skipping steps whose condition does not hold over the
//! instance data. Predicates are pure functions registered under a name and
//! resolved from a table, so the persisted `current_step` stays a plain
//! string.
//!
//! ```rust
//! use process_manager::ProcessDefinition;
//!
//! let payment = ProcessDefinition::builder("SimplePayment", "SubmitPayment")
//!     .predicate("requiresFx", |data| {
//!         data.get("requiresFx").and_then(|v| v.as_bool()).unwrap_or(false)
//!     })
//!     .start_with("BookLimits")
//!     .with_compensation("ReverseLimits")
//!     .then_if("requiresFx")
//!     .when_true("BookFx")
//!     .with_compensation("UnwindFx")
//!     .then("CreateTransaction")
//!     .with_compensation("ReverseTransaction")
//!     .then("CreatePayment")
//!     .end()
//!     .unwrap();
//! # let _ = payment;
//! ```

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ProcessError;

/// Pure predicate over the instance data.
pub type StepPredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Predicate over a step error message, deciding retryability.
pub type RetryPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// One step in the process graph.
#[derive(Clone)]
pub struct StepRecord {
    /// Command type this step issues
    pub name: String,
    /// Command type that undoes this step, when one exists
    pub compensation: Option<String>,
    /// Predicate id gating entry into this step; `None` runs always
    pub condition: Option<String>,
    /// Retries granted before the step counts as failed
    pub max_retries: u32,
    /// Predicate id consulted per error; `None` means any error retries
    /// while retries remain
    pub retry_when: Option<String>,
}

/// A compiled process definition.
pub struct ProcessDefinition {
    process_type: String,
    initiation_command: String,
    steps: Vec<StepRecord>,
    predicates: HashMap<String, StepPredicate>,
    retry_predicates: HashMap<String, RetryPredicate>,
}

impl ProcessDefinition {
    pub fn builder(
        process_type: impl Into<String>,
        initiation_command: impl Into<String>,
    ) -> ProcessDefinitionBuilder {
        ProcessDefinitionBuilder {
            process_type: process_type.into(),
            initiation_command: initiation_command.into(),
            steps: Vec::new(),
            predicates: HashMap::new(),
            retry_predicates: HashMap::new(),
        }
    }

    pub fn process_type(&self) -> &str {
        &self.process_type
    }

    /// The command name that starts an instance of this process.
    pub fn initiation_command(&self) -> &str {
        &self.initiation_command
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    pub fn first_step(&self) -> &StepRecord {
        &self.steps[0]
    }

    pub fn step(&self, name: &str) -> Option<(usize, &StepRecord)> {
        self.steps
            .iter()
            .enumerate()
            .find(|(_, s)| s.name == name)
    }

    /// Step owning the given compensation command, if any.
    pub fn step_for_compensation(&self, compensation: &str) -> Option<&StepRecord> {
        self.steps
            .iter()
            .find(|s| s.compensation.as_deref() == Some(compensation))
    }

    /// The next runnable step after `index`, evaluating entry conditions
    /// over `data`. `None` means the process is complete.
    pub fn next_after(
        &self,
        index: usize,
        data: &Value,
    ) -> Result<Option<&StepRecord>, ProcessError> {
        let mut idx = index + 1;
        while let Some(step) = self.steps.get(idx) {
            match &step.condition {
                Some(predicate) if !self.eval(predicate, data)? => idx += 1,
                _ => return Ok(Some(step)),
            }
        }
        Ok(None)
    }

    fn eval(&self, predicate: &str, data: &Value) -> Result<bool, ProcessError> {
        let f = self
            .predicates
            .get(predicate)
            .ok_or_else(|| ProcessError::UnknownPredicate(predicate.to_string()))?;
        Ok(f(data))
    }

    /// Whether a failed step may be retried for this error.
    pub fn is_retryable(&self, step: &StepRecord, error: &str) -> bool {
        if step.max_retries == 0 {
            return false;
        }
        match &step.retry_when {
            Some(predicate) => self
                .retry_predicates
                .get(predicate)
                .map(|f| f(error))
                .unwrap_or(false),
            None => true,
        }
    }

    pub fn max_retries(&self, step: &StepRecord) -> u32 {
        step.max_retries
    }
}

/// Fluent builder collecting steps, compiled by [`end`](Self::end).
pub struct ProcessDefinitionBuilder {
    process_type: String,
    initiation_command: String,
    steps: Vec<StepRecord>,
    predicates: HashMap<String, StepPredicate>,
    retry_predicates: HashMap<String, RetryPredicate>,
}

impl ProcessDefinitionBuilder {
    fn push(mut self, name: &str, condition: Option<String>) -> Self {
        self.steps.push(StepRecord {
            name: name.to_string(),
            compensation: None,
            condition,
            max_retries: 0,
            retry_when: None,
        });
        self
    }

    pub fn start_with(self, name: &str) -> Self {
        self.push(name, None)
    }

    pub fn then(self, name: &str) -> Self {
        self.push(name, None)
    }

    /// Begin a conditional branch; the step named by the following
    /// [`when_true`](ConditionalStep::when_true) runs only when the
    /// predicate holds.
    pub fn then_if(self, predicate: &str) -> ConditionalStep {
        ConditionalStep {
            builder: self,
            predicate: predicate.to_string(),
        }
    }

    /// Attach a compensation command to the most recent step.
    pub fn with_compensation(mut self, name: &str) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.compensation = Some(name.to_string());
        }
        self
    }

    /// Grant the most recent step up to `n` retries.
    pub fn with_retries(mut self, n: u32) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.max_retries = n;
        }
        self
    }

    /// Gate the most recent step's retries on a named error predicate.
    pub fn retry_when(mut self, predicate: &str) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.retry_when = Some(predicate.to_string());
        }
        self
    }

    /// Register a named predicate over the instance data.
    pub fn predicate(
        mut self,
        id: &str,
        f: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicates.insert(id.to_string(), Arc::new(f));
        self
    }

    /// Register a named predicate over step error messages.
    pub fn retry_predicate(
        mut self,
        id: &str,
        f: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_predicates.insert(id.to_string(), Arc::new(f));
        self
    }

    /// Compile the definition, checking the graph is non-empty and every
    /// referenced predicate exists.
    pub fn end(self) -> Result<ProcessDefinition, ProcessError> {
        if self.steps.is_empty() {
            return Err(ProcessError::EmptyProcess(self.process_type));
        }
        for step in &self.steps {
            if let Some(p) = &step.condition {
                if !self.predicates.contains_key(p) {
                    return Err(ProcessError::UnknownPredicate(p.clone()));
                }
            }
            if let Some(p) = &step.retry_when {
                if !self.retry_predicates.contains_key(p) {
                    return Err(ProcessError::UnknownPredicate(p.clone()));
                }
            }
        }
        Ok(ProcessDefinition {
            process_type: self.process_type,
            initiation_command: self.initiation_command,
            steps: self.steps,
            predicates: self.predicates,
            retry_predicates: self.retry_predicates,
        })
    }
}

/// Intermediate builder state after [`then_if`](ProcessDefinitionBuilder::then_if).
pub struct ConditionalStep {
    builder: ProcessDefinitionBuilder,
    predicate: String,
}

impl ConditionalStep {
    pub fn when_true(self, name: &str) -> ProcessDefinitionBuilder {
        let predicate = self.predicate;
        self.builder.push(name, Some(predicate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payment_definition() -> ProcessDefinition {
        ProcessDefinition::builder("SimplePayment", "SubmitPayment")
            .predicate("requiresFx", |data| {
                data.get("requiresFx").and_then(Value::as_bool).unwrap_or(false)
            })
            .retry_predicate("transientOnly", |error| error.contains("timeout"))
            .start_with("BookLimits")
            .with_compensation("ReverseLimits")
            .then_if("requiresFx")
            .when_true("BookFx")
            .with_compensation("UnwindFx")
            .then("CreateTransaction")
            .with_compensation("ReverseTransaction")
            .with_retries(2)
            .retry_when("transientOnly")
            .then("CreatePayment")
            .end()
            .unwrap()
    }

    #[test]
    fn test_branch_taken_when_predicate_holds() {
        let def = payment_definition();
        let data = json!({"requiresFx": true});

        let next = def.next_after(0, &data).unwrap().unwrap();
        assert_eq!(next.name, "BookFx");
        let next = def.next_after(1, &data).unwrap().unwrap();
        assert_eq!(next.name, "CreateTransaction");
    }

    #[test]
    fn test_branch_skipped_when_predicate_fails() {
        let def = payment_definition();
        let data = json!({"requiresFx": false});

        let next = def.next_after(0, &data).unwrap().unwrap();
        assert_eq!(next.name, "CreateTransaction");
    }

    #[test]
    fn test_traversal_ends_after_last_step() {
        let def = payment_definition();
        let (idx, _) = def.step("CreatePayment").unwrap();
        assert!(def.next_after(idx, &json!({})).unwrap().is_none());
    }

    #[test]
    fn test_compensations_attach_to_their_steps() {
        let def = payment_definition();
        let (_, book_fx) = def.step("BookFx").unwrap();
        assert_eq!(book_fx.compensation.as_deref(), Some("UnwindFx"));
        let (_, create_payment) = def.step("CreatePayment").unwrap();
        assert!(create_payment.compensation.is_none());
        assert_eq!(
            def.step_for_compensation("ReverseLimits").unwrap().name,
            "BookLimits"
        );
    }

    #[test]
    fn test_retry_rules() {
        let def = payment_definition();
        let (_, book_limits) = def.step("BookLimits").unwrap();
        // no retries granted
        assert!(!def.is_retryable(book_limits, "timeout"));

        let (_, create_tx) = def.step("CreateTransaction").unwrap();
        assert!(def.is_retryable(create_tx, "connection timeout"));
        assert!(!def.is_retryable(create_tx, "insufficient funds"));
        assert_eq!(def.max_retries(create_tx), 2);
    }

    #[test]
    fn test_end_rejects_unknown_predicate() {
        let result = ProcessDefinition::builder("P", "StartP")
            .start_with("A")
            .then_if("nope")
            .when_true("B")
            .end();
        assert!(matches!(result, Err(ProcessError::UnknownPredicate(p)) if p == "nope"));
    }

    #[test]
    fn test_end_rejects_empty_graph() {
        let result = ProcessDefinition::builder("P", "StartP").end();
        assert!(matches!(result, Err(ProcessError::EmptyProcess(_))));
    }
}
