//! Native implementations for operations the model leaves unspecified.
//!
//! A `is not yet specified` body looks up a [`Delegate`] registered for the
//! enclosing class or module. The `CPU` pseudo-class of the real-time dialect
//! is always available as a built-in fallback.

use crate::context::ThreadState;
use crate::scheduler::Scheduler;
use dashmap::DashMap;
use std::sync::Arc;
use tempo_types::ast::Name;
use tempo_types::{ObjectRef, Value};

/// The class of virtual processing units.
pub const CPU_CLASS: &str = "CPU";

/// One unspecified operation being invoked.
pub struct DelegateCall<'c> {
    pub owner: &'c str,
    pub operation: &'c Name,
    pub args: &'c [Value],
    pub this: Option<ObjectRef>,
    pub scheduler: &'c dyn Scheduler,
    pub thread: &'c ThreadState,
}

pub trait Delegate: Send + Sync {
    /// `None` if this delegate does not implement the operation.
    fn invoke(&self, call: &DelegateCall<'_>) -> Option<Result<Value, String>>;
}

#[derive(Default)]
pub struct DelegateRegistry {
    delegates: DashMap<String, Arc<dyn Delegate>>,
}

impl DelegateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, owner: impl Into<String>, delegate: Arc<dyn Delegate>) {
        self.delegates.insert(owner.into(), delegate);
    }

    pub fn invoke(&self, call: &DelegateCall<'_>) -> Option<Result<Value, String>> {
        let registered = self.delegates.get(call.owner).map(|d| d.value().clone());
        if let Some(delegate) = registered {
            if let Some(result) = delegate.invoke(call) {
                return Some(result);
            }
        }
        if call.owner == CPU_CLASS {
            return CpuDelegate.invoke(call);
        }
        None
    }
}

/// `new CPU(policy, hz)`, `cpu.deploy(obj)`, `cpu.setPriority(op, n)`.
pub struct CpuDelegate;

impl CpuDelegate {
    fn cpu_id(this: &Option<ObjectRef>) -> Result<u32, String> {
        let obj = this.as_ref().ok_or("CPU operation called without an instance")?;
        u32::try_from(obj.id()).map_err(|_| format!("too many CPUs: #{}", obj.id()))
    }
}

impl Delegate for CpuDelegate {
    fn invoke(&self, call: &DelegateCall<'_>) -> Option<Result<Value, String>> {
        let result = match call.operation.text.as_str() {
            CPU_CLASS => Self::cpu_id(&call.this).and_then(|cpu| {
                let hz = call
                    .args
                    .get(1)
                    .ok_or_else(|| "CPU constructor expects (policy, hz)".to_string())?
                    .nat_value()
                    .map_err(|e| e.to_string())?;
                call.scheduler.define_cpu(cpu, hz);
                Ok(Value::Void)
            }),
            "deploy" => Self::cpu_id(&call.this).and_then(|cpu| {
                let obj = call
                    .args
                    .first()
                    .ok_or_else(|| "deploy expects an object".to_string())?
                    .object_value()
                    .map_err(|e| e.to_string())?;
                call.scheduler.deploy(&obj, cpu);
                Ok(Value::Void)
            }),
            "setPriority" => Ok(Value::Void),
            _ => return None,
        };
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::LocalScheduler;
    use tempo_types::ObjectValue;

    struct Fixed;

    impl Delegate for Fixed {
        fn invoke(&self, call: &DelegateCall<'_>) -> Option<Result<Value, String>> {
            (call.operation.text == "answer").then(|| Ok(Value::Int(42)))
        }
    }

    #[test]
    fn test_registered_delegate() {
        let registry = DelegateRegistry::new();
        registry.register("IO", Arc::new(Fixed));
        let sched = LocalScheduler::new(1_000, None);
        let thread = sched.attach("main", 0);
        let name = Name::new("IO", "answer");
        let call = DelegateCall {
            owner: "IO",
            operation: &name,
            args: &[],
            this: None,
            scheduler: &sched,
            thread: &thread,
        };
        assert_eq!(registry.invoke(&call).unwrap().unwrap(), Value::Int(42));
        let other = Name::new("IO", "question");
        let call = DelegateCall {
            operation: &other,
            ..call
        };
        assert!(registry.invoke(&call).is_none());
    }

    #[test]
    fn test_cpu_fallback_defines_and_deploys() {
        let registry = DelegateRegistry::new();
        let sched = LocalScheduler::new(1_000, None);
        let thread = sched.attach("main", 0);
        let cpu = ObjectValue::new(CPU_CLASS);
        let ctor = Name::new(CPU_CLASS, CPU_CLASS);
        let args = [Value::Quote("FP".into()), Value::Int(2_000)];
        let call = DelegateCall {
            owner: CPU_CLASS,
            operation: &ctor,
            args: &args,
            this: Some(cpu.clone()),
            scheduler: &sched,
            thread: &thread,
        };
        assert!(registry.invoke(&call).unwrap().is_ok());

        let worker = ObjectValue::new("Worker");
        let deploy = Name::new(CPU_CLASS, "deploy");
        let args = [Value::Object(worker.clone())];
        let call = DelegateCall {
            operation: &deploy,
            args: &args,
            ..call
        };
        assert!(registry.invoke(&call).unwrap().is_ok());
        assert_eq!(worker.cpu(), Some(cpu.id() as u32));

        let bound = ThreadState::new(99, "w", cpu.id() as u32);
        assert_eq!(sched.cycles_to_duration(&bound, 2_000), 1_000_000_000);
    }
}
