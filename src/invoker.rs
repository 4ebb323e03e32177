//! Invoker
//!
//! Calls a resolved method with marshalled arguments. Instance methods get a
//! fresh receiver built right before the call and dropped right after it, so
//! no receiver state survives between invocations. Panics raised by target
//! code are caught and classified like any other fault of that code.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use thiserror::Error;
use tracing::debug;

use crate::module::{Argument, Fault, MethodBody, Value};
use crate::resolver::ResolvedMethod;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvokeError {
    #[error("cannot construct receiver of type '{type_name}': {cause}")]
    ReceiverConstruction { type_name: String, cause: String },

    #[error("'{type_name}.{method}' failed: {fault}")]
    TargetInvocation {
        type_name: String,
        method: String,
        fault: Fault,
    },
}

/// Invoke `method`. `Ok(None)` means the method produced no value.
pub fn invoke(method: &ResolvedMethod, args: &[Argument]) -> Result<Option<Value>, InvokeError> {
    let outcome = match &method.body {
        MethodBody::Static(body) => catch(|| body(args)),
        MethodBody::Instance(body) => {
            let ctor = method
                .constructor
                .as_ref()
                .ok_or_else(|| InvokeError::ReceiverConstruction {
                    type_name: method.declaring_type.clone(),
                    cause: "type has no default constructor".to_string(),
                })?;

            let mut receiver = catch(|| ctor()).map_err(|fault| InvokeError::ReceiverConstruction {
                type_name: method.declaring_type.clone(),
                cause: fault.message,
            })?;
            debug!(type_name = %method.declaring_type, "constructed receiver");

            catch(|| body(&mut receiver, args))
        }
    };

    let value = outcome.map_err(|fault| InvokeError::TargetInvocation {
        type_name: method.declaring_type.clone(),
        method: method.name.clone(),
        fault,
    })?;

    if method.returns.is_void() {
        return Ok(None);
    }
    Ok(value)
}

/// Run target code, turning a panic into a fault
fn catch<T>(f: impl FnOnce() -> Result<T, Fault>) -> Result<T, Fault> {
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        Err(Fault::new(format!("panicked: {}", panic_message(&*payload))))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
