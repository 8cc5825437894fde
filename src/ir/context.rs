//! The IR arena

use crate::ir::inst::{Inst, InstId};
use crate::ir::value::{BlockData, FunctionData, GlobalTag, Value, ValueId, ValueKind, ValueType};

use std::collections::BTreeMap;

/// Process-wide arena for a single compilation unit.
///
/// Owns every IR value and instruction; everything else holds ids.
/// Passes unlink nodes and mark them dead; the storage is reclaimed
/// all at once when the context is dropped. Strictly single-threaded.
#[derive(Debug)]
pub struct IrContext {
    values: Vec<Value>,
    insts: Vec<Inst>,

    /// Functions with bodies, in creation order.
    pub functions: Vec<ValueId>,
    /// Module-scope variables.
    pub globals: Vec<ValueId>,
    /// Interned string literals and their contents.
    pub static_strings: Vec<(ValueId, String)>,
    /// Runtime and foreign functions without bodies.
    pub externs: Vec<ValueId>,

    constants: BTreeMap<(ValueType, i64), ValueId>,

    /// Convenience singletons.
    pub const_true: ValueId,
    pub const_false: ValueId,
    pub const_one: ValueId,
    pub const_zero: ValueId,
}

impl IrContext {
    pub fn new() -> Self {
        let mut ctx = IrContext {
            values: Vec::new(),
            insts: Vec::new(),
            functions: Vec::new(),
            globals: Vec::new(),
            static_strings: Vec::new(),
            externs: Vec::new(),
            constants: BTreeMap::new(),
            const_true: ValueId(0),
            const_false: ValueId(0),
            const_one: ValueId(0),
            const_zero: ValueId(0),
        };

        ctx.const_true = ctx.const_int(ValueType::I64, 1);
        ctx.const_false = ctx.const_int(ValueType::I64, 0);
        ctx.const_one = ctx.const_true;
        ctx.const_zero = ctx.const_false;

        ctx
    }

    pub fn value(&self, id: ValueId) -> &Value {
        &self.values[id.index()]
    }

    pub fn value_mut(&mut self, id: ValueId) -> &mut Value {
        &mut self.values[id.index()]
    }

    pub fn inst(&self, id: InstId) -> &Inst {
        &self.insts[id.index()]
    }

    pub fn inst_mut(&mut self, id: InstId) -> &mut Inst {
        &mut self.insts[id.index()]
    }

    pub(crate) fn alloc_value(&mut self, value: Value) -> ValueId {
        let id = ValueId(self.values.len() as u32);
        self.values.push(value);
        id
    }

    pub(crate) fn alloc_inst(&mut self, inst: Inst) -> InstId {
        let id = InstId(self.insts.len() as u32);
        self.insts.push(inst);
        id
    }

    /// The interned constant for `value` at type `ty`.
    pub fn const_int(&mut self, ty: ValueType, value: i64) -> ValueId {
        if let Some(&id) = self.constants.get(&(ty, value)) {
            return id;
        }
        let id = self.alloc_value(Value::new(ty, ValueKind::ConstInt(value)));
        self.constants.insert((ty, value), id);
        id
    }

    pub fn create_argument(&mut self, ty: ValueType, name: &str) -> ValueId {
        let mut value = Value::new(ty, ValueKind::Argument);
        value.name = Some(name.to_string());
        self.alloc_value(value)
    }

    pub fn create_global(&mut self, ty: ValueType, name: &str) -> ValueId {
        let mut value = Value::new(ty, ValueKind::Global(GlobalTag::Variable));
        value.name = Some(name.to_string());
        let id = self.alloc_value(value);
        self.globals.push(id);
        id
    }

    pub fn create_static_string(&mut self, name: &str, contents: &str) -> ValueId {
        let mut value = Value::new(ValueType::BoxOrInt, ValueKind::Global(GlobalTag::Static));
        value.name = Some(name.to_string());
        let id = self.alloc_value(value);
        self.static_strings.push((id, contents.to_string()));
        id
    }

    pub fn create_function(&mut self, name: &str) -> ValueId {
        let mut value = Value::new(ValueType::CodeAddress, ValueKind::Function(FunctionData::new(false)));
        value.name = Some(name.to_string());
        let id = self.alloc_value(value);
        self.functions.push(id);
        id
    }

    pub fn create_extern_function(&mut self, name: &str) -> ValueId {
        let mut value = Value::new(ValueType::CodeAddress, ValueKind::Function(FunctionData::new(true)));
        value.name = Some(name.to_string());
        let id = self.alloc_value(value);
        self.externs.push(id);
        id
    }

    /// A fresh local slot registered with `func`.
    pub fn create_local(&mut self, func: ValueId, ty: ValueType, name: &str) -> ValueId {
        let mut value = Value::new(ty, ValueKind::Local);
        value.name = Some(name.to_string());
        value.owner = Some(func);
        let id = self.alloc_value(value);
        self.value_mut(func).function_mut().locals.push(id);
        id
    }

    /// A fresh numbered temporary registered with `func`.
    pub fn create_temp(&mut self, func: ValueId, ty: ValueType) -> ValueId {
        let seq = self.next_seq(func);
        let mut value = Value::new(ty, ValueKind::Temp);
        value.seq = Some(seq);
        value.owner = Some(func);
        let id = self.alloc_value(value);
        self.value_mut(func).function_mut().temps.push(id);
        id
    }

    /// A fresh named temporary registered with `func`; used by SSA
    /// renaming, which derives names from the original variable.
    pub fn create_named_temp(&mut self, func: ValueId, ty: ValueType, name: &str) -> ValueId {
        let mut value = Value::new(ty, ValueKind::Temp);
        value.name = Some(name.to_string());
        value.owner = Some(func);
        let id = self.alloc_value(value);
        self.value_mut(func).function_mut().temps.push(id);
        id
    }

    /// A fresh block appended to `func`.
    pub fn create_block(&mut self, func: ValueId) -> ValueId {
        let seq = self.next_seq(func);
        let mut value = Value::new(
            ValueType::CodeAddress,
            ValueKind::Block(BlockData {
                parent: func,
                insts: Vec::new(),
                preds: Vec::new(),
            }),
        );
        value.seq = Some(seq);
        value.owner = Some(func);
        let id = self.alloc_value(value);
        self.value_mut(func).function_mut().blocks.push(id);
        id
    }

    fn next_seq(&mut self, func: ValueId) -> i64 {
        let data = self.value_mut(func).function_mut();
        let seq = data.next_seq;
        data.next_seq += 1;
        seq
    }
}

impl Default for IrContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_interned_by_type_and_value() {
        let mut ctx = IrContext::new();
        let a = ctx.const_int(ValueType::I64, 42);
        let b = ctx.const_int(ValueType::I64, 42);
        let c = ctx.const_int(ValueType::I32, 42);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(ctx.value(a).as_const_int(), Some(42));
    }

    #[test]
    fn singletons_share_the_intern_table() {
        let mut ctx = IrContext::new();
        let one = ctx.const_int(ValueType::I64, 1);
        assert_eq!(one, ctx.const_one);
        assert_eq!(ctx.const_true, ctx.const_one);
        assert_eq!(ctx.const_false, ctx.const_zero);
    }
}
