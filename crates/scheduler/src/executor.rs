use std::sync::Arc;

use action_primitives::{Actuator, ActuatorFault};
use async_trait::async_trait;

use crate::environment::SessionHandle;

/// Binds an actuator to a freshly acquired session.
#[async_trait]
pub trait ActuatorFactory: Send + Sync {
    async fn actuator_for(&self, session: &SessionHandle) -> Result<Arc<dyn Actuator>, ActuatorFault>;
}

/// Hands every session the same actuator.
#[derive(Clone)]
pub struct SharedActuator {
    actuator: Arc<dyn Actuator>,
}

impl SharedActuator {
    pub fn new(actuator: Arc<dyn Actuator>) -> Self {
        Self { actuator }
    }
}

#[async_trait]
impl ActuatorFactory for SharedActuator {
    async fn actuator_for(&self, _session: &SessionHandle) -> Result<Arc<dyn Actuator>, ActuatorFault> {
        Ok(Arc::clone(&self.actuator))
    }
}

/// Builds a new actuator per session from a closure.
pub struct FnActuatorFactory<F> {
    build: F,
}

impl<F> FnActuatorFactory<F>
where
    F: Fn(&SessionHandle) -> Arc<dyn Actuator> + Send + Sync,
{
    pub fn new(build: F) -> Self {
        Self { build }
    }
}

#[async_trait]
impl<F> ActuatorFactory for FnActuatorFactory<F>
where
    F: Fn(&SessionHandle) -> Arc<dyn Actuator> + Send + Sync,
{
    async fn actuator_for(&self, session: &SessionHandle) -> Result<Arc<dyn Actuator>, ActuatorFault> {
        Ok((self.build)(session))
    }
}
