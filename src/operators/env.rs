use super::{string_arg, ArgShape, Registry};
use crate::context::EvalContext;
use crate::error::Result;
use crate::value::Value;

pub(super) fn register(registry: &mut Registry) {
    registry.add("$env", ArgShape::exact(1), env);
}

/// Look up a named binding in the runtime environment. An unknown name, or
/// no environment at all, yields a missing value.
fn env(args: &[Value], ctx: &EvalContext<'_>) -> Result<Value> {
    let name = string_arg("$env", &args[0])?;
    Ok(ctx
        .runtime
        .environment
        .as_ref()
        .and_then(|env| env.get(name))
        .unwrap_or(Value::Missing))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::context::{MemoryEnvironment, Runtime};

    #[test]
    fn reads_bindings_from_runtime() {
        let mut runtime = Runtime::default();
        runtime.environment = Some(Arc::new(MemoryEnvironment::new().with("c_limit", 3)));
        let root = Value::Null;
        let ctx = EvalContext::new(&runtime, &root);
        assert_eq!(env(&[Value::from("c_limit")], &ctx).unwrap(), Value::from(3));
        assert!(env(&[Value::from("other")], &ctx).unwrap().is_missing());
        assert!(env(&[Value::from(1)], &ctx).is_err());
    }
}
