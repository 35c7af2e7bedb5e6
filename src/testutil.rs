//! Shared test doubles.

use std::cell::RefCell;

use crate::gateway::{Action, ActionOutput, ActionRunner, GatewayError};

/// Gateway double that records every dispatched action by name and can be
/// scripted to fail a specific action.
pub struct FakeGateway {
    fail_on: Option<&'static str>,
    calls: RefCell<Vec<&'static str>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self {
            fail_on: None,
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn failing_on(action_name: &'static str) -> Self {
        Self {
            fail_on: Some(action_name),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.borrow().clone()
    }
}

impl ActionRunner for FakeGateway {
    fn execute(&self, action: &Action) -> Result<ActionOutput, GatewayError> {
        let name = action.name();
        self.calls.borrow_mut().push(name);
        if self.fail_on == Some(name) {
            return Err(GatewayError::ExternalFailure {
                status: Some(1),
                stderr: format!("scripted failure for {name}"),
            });
        }
        Ok(ActionOutput {
            stdout: String::new(),
        })
    }
}
