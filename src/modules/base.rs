//! Base globals: the minimal library every thread sees.

use std::rc::Rc;

use crate::vm::{NativeFn, Table, Value, Vm, VmError};

pub fn install_globals(vm: &Rc<Vm>) {
    let globals = vm.globals();
    globals.set(
        Value::from("print"),
        Value::from_native(NativeFn::sync("print", |_cx, args| {
            let line = args
                .iter()
                .map(|v| v.to_string())
                .collect::<Vec<_>>()
                .join("\t");
            println!("{}", line);
            Ok(Vec::new())
        })),
    );

    globals.set(
        Value::from("assert"),
        Value::from_native(NativeFn::sync("assert", |_cx, args| {
            let value = args.first().cloned().unwrap_or(Value::Nil);
            if value.truthy() {
                return Ok(args);
            }
            let message = match args.get(1) {
                Some(m) => m.to_string(),
                None => "assertion failed!".to_string(),
            };
            Err(VmError::script(message))
        })),
    );

    globals.set(
        Value::from("error"),
        Value::from_native(NativeFn::sync("error", |_cx, args| {
            let message = args
                .first()
                .map(|v| v.to_string())
                .unwrap_or_else(|| "nil".to_string());
            Err(VmError::script(message))
        })),
    );

    globals.set(
        Value::from("tostring"),
        Value::from_native(NativeFn::sync("tostring", |_cx, args| {
            let value = args.first().cloned().unwrap_or(Value::Nil);
            Ok(vec![Value::from(value.to_string())])
        })),
    );

    globals.set(
        Value::from("type"),
        Value::from_native(NativeFn::sync("type", |_cx, args| {
            let value = args.first().cloned().unwrap_or(Value::Nil);
            Ok(vec![Value::from(value.type_name())])
        })),
    );

    // coroutine.yield is the host-level cooperative yield; the driver
    // requeues the thread unless a non-empty payload makes it fatal at top
    // level
    let coroutine = Table::new();
    coroutine.set(
        Value::from("yield"),
        Value::from_native(NativeFn::new("yield", |cx, args| {
            Box::pin(async move { cx.yield_now(args).await })
        })),
    );
    globals.set(Value::from("coroutine"), Value::Table(coroutine));
}

#[cfg(test)]
mod tests {
    use crate::runtime::Runtime;
    use crate::vm::thread::{Resume, ResumeMsg};
    use crate::vm::{Value, Vm};

    fn eval(source: &str) -> Result<Vec<Value>, String> {
        let rt = Runtime::new();
        let chunk = Vm::compile(source, "@test").map_err(|e| e.to_string())?;
        let co = rt.vm().create_chunk_thread(chunk);
        match co.resume(ResumeMsg::Values(Vec::new())) {
            Resume::Done(values) => Ok(values),
            Resume::Error(err) => Err(err.to_string()),
            Resume::Yield { .. } => Err("unexpected yield".to_string()),
        }
    }

    #[test]
    fn assert_passes_values_through() {
        let values = eval("return assert(42)").expect("assert");
        assert_eq!(values, vec![Value::from(42.0)]);
    }

    #[test]
    fn assert_raises_with_custom_message() {
        let err = eval("assert(false, \"nope\")").expect_err("should fail");
        assert_eq!(err, "nope");
        let err = eval("assert(nil)").expect_err("should fail");
        assert_eq!(err, "assertion failed!");
    }

    #[test]
    fn error_raises_its_message() {
        let err = eval("error(\"boom\")").expect_err("should fail");
        assert_eq!(err, "boom");
    }

    #[test]
    fn tostring_and_type() {
        let values = eval("return tostring(1), tostring(nil), type({}), type(\"s\")")
            .expect("eval");
        assert_eq!(
            values,
            vec![
                Value::from("1"),
                Value::from("nil"),
                Value::from("table"),
                Value::from("string"),
            ]
        );
    }
}
