/// Native-function registry (C7). Registration order is fixed — `print_int`
/// is id 0, `print_string` id 1 — matching the dense ids the semantic pass's
/// `NativeHints` table assigns to `use func` declarations.
use std::collections::HashMap;

use xplice_compiler::ir::{Errcode, Value};

use crate::vm::Vm;

pub type NativeFn = fn(&mut Vm, &[Value]) -> Errcode;

/// Writes an int argument to the VM's configured stdout sink, pushing
/// `Int(0)` on success or `Int(1)` if the argument wasn't an int.
fn print_int(vm: &mut Vm, args: &[Value]) -> Errcode {
    match args.first() {
        Some(Value::Int(n)) => {
            vm.write_stdout(&format!("{} ", n));
            vm.push_from_native(Value::Int(0));
        }
        _ => vm.push_from_native(Value::Int(1)),
    }
    Errcode::Normal
}

/// `Value` has no string variant, since string literals aren't part of the
/// expression grammar, so this native can never actually receive one; it
/// always reports the type-error sentinel, kept only so `print_string`
/// occupies its reserved native id.
fn print_string(vm: &mut Vm, _args: &[Value]) -> Errcode {
    vm.push_from_native(Value::Int(1));
    Errcode::Normal
}

/// Builds the fixed native catalogue in its canonical id order.
pub fn registry() -> HashMap<i32, NativeFn> {
    let mut natives: HashMap<i32, NativeFn> = HashMap::new();
    natives.insert(0, print_int as NativeFn);
    natives.insert(1, print_string as NativeFn);
    natives
}
