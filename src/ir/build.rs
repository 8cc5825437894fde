//! TAC construction from the typed AST
//!
//! One IR function is produced per (source function, distinct type
//! assignment) pair reached from the entry point. The worklist is
//! seeded with `main` under the empty assignment; generic call sites
//! push new pairs as they are visited.

use crate::ast::{
    self, BinOp as AstBinOp, CmpOp as AstCmpOp, Expr, FunctionDef, LValue, LogicalOp, MatchArm,
    Param, Span, Stmt, Type, TypeAssignment,
};
use crate::consts::{
    ENTRY_SYMBOL, ERR_HEAD_EMPTY, ERR_TAIL_EMPTY, ERR_UNKNOWN, FIELD_BASE_OFFSET, REFMASK_SHIFT,
    TAG_MASK, WORD_SIZE,
};
use crate::error::{CodegenError, CompileError, MonomorphizationError};
use crate::ir::context::IrContext;
use crate::ir::inst::{BinOp, CmpOp, InstKind};
use crate::ir::value::{ValueId, ValueType};

use std::collections::{BTreeMap, VecDeque};
use tracing::debug;

/// Lower a type-checked program into TAC rooted at `ctx`.
pub fn build(program: &ast::Program, ctx: &mut IrContext) -> Result<(), CompileError> {
    TacBuilder::new(program, ctx).run()
}

/// A function body waiting to be instantiated.
enum WorkItem {
    Function {
        def: FunctionDef,
        assignment: TypeAssignment,
        func: ValueId,
        /// Lower global initializers at the top of this body.
        entry: bool,
    },
    Lambda {
        params: Vec<Param>,
        captures: Vec<(String, Type)>,
        body: Expr,
        assignment: TypeAssignment,
        func: ValueId,
    },
    Constructor {
        tag: i64,
        fields: Vec<Type>,
        func: ValueId,
    },
}

struct TacBuilder<'a> {
    program: &'a ast::Program,
    ctx: &'a mut IrContext,

    worklist: VecDeque<WorkItem>,
    /// Monomorphization cache: each pair is instantiated at most once.
    instances: BTreeMap<(String, TypeAssignment), ValueId>,
    /// Constructor header words, cached per (symbol, assignment).
    layouts: BTreeMap<(String, TypeAssignment), i64>,
    runtime: BTreeMap<&'static str, ValueId>,
    externs: BTreeMap<String, ValueId>,
    globals: BTreeMap<String, ValueId>,
    strings: BTreeMap<String, ValueId>,
    lambda_counter: usize,

    // Per-function state, reset for every work item.
    func: ValueId,
    block: ValueId,
    locals: BTreeMap<String, ValueId>,
    args: BTreeMap<String, ValueId>,
    type_ctx: TypeAssignment,
    /// `(continue target, break target)` of each enclosing loop.
    loop_stack: Vec<(ValueId, ValueId)>,
    name_counter: usize,
}

impl<'a> TacBuilder<'a> {
    fn new(program: &'a ast::Program, ctx: &'a mut IrContext) -> Self {
        TacBuilder {
            program,
            ctx,
            worklist: VecDeque::new(),
            instances: BTreeMap::new(),
            layouts: BTreeMap::new(),
            runtime: BTreeMap::new(),
            externs: BTreeMap::new(),
            globals: BTreeMap::new(),
            strings: BTreeMap::new(),
            lambda_counter: 0,
            func: ValueId(u32::MAX),
            block: ValueId(u32::MAX),
            locals: BTreeMap::new(),
            args: BTreeMap::new(),
            type_ctx: TypeAssignment::new(),
            loop_stack: Vec::new(),
            name_counter: 0,
        }
    }

    fn run(mut self) -> Result<(), CompileError> {
        for name in ["gcAllocate", "print", "die", "cons", "incref", "decref", "decrefNoFree"] {
            let f = self.ctx.create_extern_function(name);
            self.runtime.insert(name, f);
        }
        for ext in &self.program.externs {
            let f = self.ctx.create_extern_function(&ext.name);
            self.externs.insert(ext.name.clone(), f);
        }
        for global in &self.program.globals {
            let ty = self.value_type(&global.ty)?;
            let g = self.ctx.create_global(ty, &global.name);
            self.globals.insert(global.name.clone(), g);
        }

        let main = self
            .program
            .function("main")
            .ok_or_else(|| CodegenError::new("program has no main function"))?;
        let entry = self.ctx.create_function(ENTRY_SYMBOL);
        self.instances
            .insert(("main".to_string(), TypeAssignment::new()), entry);
        self.bind_params(entry, &main.params, &TypeAssignment::new())?;
        self.worklist.push_back(WorkItem::Function {
            def: main.clone(),
            assignment: TypeAssignment::new(),
            func: entry,
            entry: true,
        });

        while let Some(item) = self.worklist.pop_front() {
            match item {
                WorkItem::Function {
                    def,
                    assignment,
                    func,
                    entry,
                } => self.build_function(&def, assignment, func, entry)?,
                WorkItem::Lambda {
                    params,
                    captures,
                    body,
                    assignment,
                    func,
                } => self.build_lambda(&params, &captures, &body, assignment, func)?,
                WorkItem::Constructor { tag, fields, func } => {
                    self.build_constructor(tag, &fields, func)?
                }
            }
        }

        debug!(
            functions = self.ctx.functions.len(),
            globals = self.ctx.globals.len(),
            "tac construction finished"
        );
        Ok(())
    }

    /* TYPES */

    fn concrete(&self, ty: &Type) -> Type {
        ty.apply(&self.type_ctx)
    }

    fn value_type(&self, ty: &Type) -> Result<ValueType, CompileError> {
        let ty = self.concrete(ty);
        match ty {
            Type::Unit | Type::Bool => Ok(ValueType::I64),
            Type::Int => Ok(ValueType::BoxOrInt),
            Type::Sized(it) => Ok(ValueType::Integer(it)),
            Type::Str
            | Type::Array(_)
            | Type::List(_)
            | Type::Func(..)
            | Type::Adt(..)
            | Type::Record(..) => Ok(ValueType::BoxOrInt),
            Type::Var(v) => Err(CodegenError::new(format!(
                "unresolved type variable t{} reached lowering",
                v
            ))
            .into()),
        }
    }

    /* PER-FUNCTION DRIVERS */

    fn begin_function(&mut self, func: ValueId, assignment: TypeAssignment) {
        self.func = func;
        self.block = self.ctx.create_block(func);
        self.locals.clear();
        self.args.clear();
        self.type_ctx = assignment;
        self.loop_stack.clear();
        self.name_counter = 0;

        let params = self.ctx.value(func).function().params.clone();
        for param in params {
            let name = self.ctx.value(param).name.clone().unwrap_or_default();
            self.args.insert(name, param);
        }
    }

    fn finish_function(&mut self) {
        if self.ctx.terminator(self.block).is_none() {
            self.emit(InstKind::Return { value: None });
        }
        self.ctx.prune_unreachable_blocks(self.func);
    }

    fn build_function(
        &mut self,
        def: &FunctionDef,
        assignment: TypeAssignment,
        func: ValueId,
        entry: bool,
    ) -> Result<(), CompileError> {
        self.begin_function(func, assignment);

        if entry {
            for global in &self.program.globals {
                let value = self.lower_expr(&global.init)?;
                let slot = self.globals[&global.name];
                self.emit(InstKind::Store { dest: slot, src: value });
            }
        }

        for stmt in &def.body {
            self.lower_stmt(stmt)?;
        }
        self.finish_function();
        Ok(())
    }

    fn build_lambda(
        &mut self,
        params: &[Param],
        captures: &[(String, Type)],
        body: &Expr,
        assignment: TypeAssignment,
        func: ValueId,
    ) -> Result<(), CompileError> {
        self.begin_function(func, assignment);

        // The closure itself arrives as the implicit last argument;
        // spill each captured word into a named local.
        let env = *self
            .ctx
            .value(func)
            .function()
            .params
            .last()
            .expect("lambda without environment parameter");
        let env_value = self.load_slot(env);
        for (i, (name, ty)) in captures.iter().enumerate() {
            let vt = self.value_type(ty)?;
            let offset = self.raw_const(FIELD_BASE_OFFSET * (i as i64 + 1));
            let field = self.ctx.create_temp(self.func, vt);
            self.emit(InstKind::IndexedLoad {
                dest: field,
                base: env_value,
                offset,
            });
            let local = self.ctx.create_local(self.func, vt, name);
            self.locals.insert(name.clone(), local);
            self.emit(InstKind::Store { dest: local, src: field });
        }

        let result = self.lower_expr(body)?;
        self.emit(InstKind::Return { value: Some(result) });
        self.finish_function();
        Ok(())
    }

    /// A constructor body: allocate, write the header, store fields.
    fn build_constructor(
        &mut self,
        tag: i64,
        fields: &[Type],
        func: ValueId,
    ) -> Result<(), CompileError> {
        self.begin_function(func, TypeAssignment::new());

        let size = WORD_SIZE * (1 + fields.len() as i64);
        let size = self.raw_const(size);
        let block = self.gc_allocate(size);

        let header = self.raw_const(tag);
        let zero = self.raw_const(0);
        self.emit(InstKind::IndexedStore {
            base: block,
            offset: zero,
            src: header,
        });

        let params = self.ctx.value(func).function().params.clone();
        for (i, param) in params.iter().enumerate() {
            let value = self.load_slot(*param);
            let offset = self.raw_const(FIELD_BASE_OFFSET * (i as i64 + 1));
            self.emit(InstKind::IndexedStore {
                base: block,
                offset,
                src: value,
            });
        }

        self.emit(InstKind::Return { value: Some(block) });
        self.finish_function();
        Ok(())
    }

    /* MONOMORPHIZATION */

    /// Resolve a call-site assignment against the enclosing type
    /// context; every callee type parameter must come out concrete.
    fn resolve_assignment(
        &self,
        type_params: &[ast::TypeVar],
        type_args: &TypeAssignment,
        span: Span,
    ) -> Result<TypeAssignment, CompileError> {
        let mut resolved = TypeAssignment::new();
        let mut unresolved = Vec::new();
        for &var in type_params {
            match type_args.get(&var) {
                Some(ty) => {
                    let ty = ty.apply(&self.type_ctx);
                    if ty.is_concrete() {
                        resolved.insert(var, ty);
                    } else {
                        unresolved.push(var);
                    }
                }
                None => unresolved.push(var),
            }
        }
        if unresolved.is_empty() {
            Ok(resolved)
        } else {
            Err(MonomorphizationError {
                span,
                vars: unresolved,
            }
            .into())
        }
    }

    fn instance_name(name: &str, assignment: &TypeAssignment) -> String {
        if assignment.is_empty() {
            return name.to_string();
        }
        let mut out = name.to_string();
        for ty in assignment.values() {
            out.push('$');
            out.push_str(&type_suffix(ty));
        }
        out
    }

    /// Instantiate `def` at `assignment`, reusing the cached instance
    /// when this pair has been requested before.
    fn instantiate(
        &mut self,
        def: &FunctionDef,
        assignment: TypeAssignment,
    ) -> Result<ValueId, CompileError> {
        let key = (def.name.clone(), assignment.clone());
        if let Some(&func) = self.instances.get(&key) {
            return Ok(func);
        }

        let name = Self::instance_name(&def.name, &assignment);
        let func = self.ctx.create_function(&name);
        self.instances.insert(key, func);
        self.bind_params(func, &def.params, &assignment)?;
        debug!(function = %name, "instantiating");
        self.worklist.push_back(WorkItem::Function {
            def: def.clone(),
            assignment,
            func,
            entry: false,
        });
        Ok(func)
    }

    fn bind_params(
        &mut self,
        func: ValueId,
        params: &[Param],
        assignment: &TypeAssignment,
    ) -> Result<(), CompileError> {
        for param in params {
            let ty = param.ty.apply(assignment);
            let saved = std::mem::replace(&mut self.type_ctx, assignment.clone());
            let vt = self.value_type(&ty);
            self.type_ctx = saved;
            let arg = self.ctx.create_argument(vt?, &param.name);
            self.ctx.add_param(func, arg);
        }
        Ok(())
    }

    /// The cached constructor header for `(symbol, assignment)`.
    fn constructor_tag(&mut self, ctor: &str, assignment: &TypeAssignment, discriminant: usize, fields: &[Type]) -> i64 {
        let key = (ctor.to_string(), assignment.clone());
        if let Some(&tag) = self.layouts.get(&key) {
            return tag;
        }
        let mut refmask: i64 = 0;
        for (i, field) in fields.iter().enumerate() {
            if field.apply(assignment).is_reference() {
                refmask |= 1 << i;
            }
        }
        let tag = (refmask << REFMASK_SHIFT) | (discriminant as i64 & TAG_MASK);
        self.layouts.insert(key, tag);
        tag
    }

    /// Instantiate the out-of-line allocator function for a
    /// constructor or record literal.
    fn constructor_fn(
        &mut self,
        name: &str,
        assignment: &TypeAssignment,
        discriminant: usize,
        fields: &[Type],
    ) -> Result<ValueId, CompileError> {
        let key = (format!("ctor${}", name), assignment.clone());
        if let Some(&func) = self.instances.get(&key) {
            return Ok(func);
        }

        let tag = self.constructor_tag(name, assignment, discriminant, fields);
        let instance = Self::instance_name(name, assignment);
        let func = self.ctx.create_function(&instance);
        self.instances.insert(key, func);

        let resolved: Vec<Type> = fields.iter().map(|f| f.apply(assignment)).collect();
        for (i, field) in resolved.iter().enumerate() {
            let saved = std::mem::replace(&mut self.type_ctx, assignment.clone());
            let vt = self.value_type(field);
            self.type_ctx = saved;
            let arg = self.ctx.create_argument(vt?, &format!("f{}", i));
            self.ctx.add_param(func, arg);
        }
        self.worklist.push_back(WorkItem::Constructor {
            tag,
            fields: resolved,
            func,
        });
        Ok(func)
    }

    /* EMISSION HELPERS */

    fn emit(&mut self, kind: InstKind) {
        self.ctx.append_inst(self.block, kind);
    }

    fn set_block(&mut self, block: ValueId) {
        self.block = block;
    }

    fn create_block(&mut self) -> ValueId {
        self.ctx.create_block(self.func)
    }

    fn fresh_name(&mut self, base: &str) -> String {
        let n = self.name_counter;
        self.name_counter += 1;
        format!("{}.{}", base, n)
    }

    fn raw_const(&mut self, value: i64) -> ValueId {
        self.ctx.const_int(ValueType::I64, value)
    }

    /// The interned tagged representation of a source integer.
    fn tagged_const(&mut self, value: i64) -> ValueId {
        self.ctx
            .const_int(ValueType::BoxOrInt, value.wrapping_mul(2).wrapping_add(1))
    }

    fn load_slot(&mut self, slot: ValueId) -> ValueId {
        let ty = self.ctx.value(slot).ty;
        let dest = self.ctx.create_temp(self.func, ty);
        self.emit(InstKind::Load { dest, src: slot });
        dest
    }

    fn untag(&mut self, src: ValueId) -> ValueId {
        let dest = self.ctx.create_temp(self.func, ValueType::I64);
        self.emit(InstKind::Untag { dest, src });
        dest
    }

    fn tag(&mut self, src: ValueId) -> ValueId {
        let dest = self.ctx.create_temp(self.func, ValueType::BoxOrInt);
        self.emit(InstKind::Tag { dest, src });
        dest
    }

    fn gc_allocate(&mut self, size: ValueId) -> ValueId {
        let dest = self.ctx.create_temp(self.func, ValueType::BoxOrInt);
        let target = self.runtime["gcAllocate"];
        self.emit(InstKind::Call {
            dest,
            target,
            args: vec![size],
            regpass: true,
            ccall: true,
        });
        dest
    }

    /// Call `die(code)` and seal the block. Never returns.
    fn emit_die(&mut self, code: i64) {
        let code = self.raw_const(code);
        let dest = self.ctx.create_temp(self.func, ValueType::I64);
        let target = self.runtime["die"];
        self.emit(InstKind::Call {
            dest,
            target,
            args: vec![code],
            regpass: true,
            ccall: true,
        });
        self.emit(InstKind::Unreachable);
    }

    /* STATEMENTS */

    fn lower_stmt(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Let { name, ty, init } => {
                let value = self.lower_expr(init)?;
                let vt = self.value_type(ty)?;
                let local = self.ctx.create_local(self.func, vt, name);
                self.locals.insert(name.clone(), local);
                self.emit(InstKind::Store { dest: local, src: value });
            }
            Stmt::Assign { target, value } => {
                let value = self.lower_expr(value)?;
                self.lower_assignment(target, value)?;
            }
            Stmt::Expr(e) => {
                self.lower_expr(e)?;
            }
            Stmt::If {
                cond,
                then_body,
                else_body,
            } => {
                let then_block = self.create_block();
                let else_block = self.create_block();
                let join = self.create_block();

                self.lower_condition(cond, then_block, else_block)?;

                self.set_block(then_block);
                for s in then_body {
                    self.lower_stmt(s)?;
                }
                if self.ctx.terminator(self.block).is_none() {
                    self.emit(InstKind::Jump { target: join });
                }

                self.set_block(else_block);
                for s in else_body {
                    self.lower_stmt(s)?;
                }
                if self.ctx.terminator(self.block).is_none() {
                    self.emit(InstKind::Jump { target: join });
                }

                self.set_block(join);
            }
            Stmt::While { cond, body } => {
                let cond_block = self.create_block();
                let body_block = self.create_block();
                let exit = self.create_block();

                self.emit(InstKind::Jump { target: cond_block });
                self.set_block(cond_block);
                self.lower_condition(cond, body_block, exit)?;

                self.set_block(body_block);
                self.loop_stack.push((cond_block, exit));
                for s in body {
                    self.lower_stmt(s)?;
                }
                self.loop_stack.pop();
                if self.ctx.terminator(self.block).is_none() {
                    self.emit(InstKind::Jump { target: cond_block });
                }

                self.set_block(exit);
            }
            Stmt::Forever { body } => {
                let body_block = self.create_block();
                let exit = self.create_block();

                self.emit(InstKind::Jump { target: body_block });
                self.set_block(body_block);
                self.loop_stack.push((body_block, exit));
                for s in body {
                    self.lower_stmt(s)?;
                }
                self.loop_stack.pop();
                if self.ctx.terminator(self.block).is_none() {
                    self.emit(InstKind::Jump { target: body_block });
                }

                self.set_block(exit);
            }
            Stmt::Break => {
                let (_, exit) = *self
                    .loop_stack
                    .last()
                    .ok_or_else(|| CodegenError::new("break outside of a loop"))?;
                self.emit(InstKind::Jump { target: exit });
                let rest = self.create_block();
                self.set_block(rest);
            }
            Stmt::Continue => {
                let (entry, _) = *self
                    .loop_stack
                    .last()
                    .ok_or_else(|| CodegenError::new("continue outside of a loop"))?;
                self.emit(InstKind::Jump { target: entry });
                let rest = self.create_block();
                self.set_block(rest);
            }
            Stmt::Return(value) => {
                let value = match value {
                    Some(e) => Some(self.lower_expr(e)?),
                    None => None,
                };
                self.emit(InstKind::Return { value });
                let rest = self.create_block();
                self.set_block(rest);
            }
            Stmt::Match { scrutinee, arms } => {
                self.lower_match(scrutinee, arms)?;
            }
            Stmt::Assert { cond } => {
                let ok = self.create_block();
                let fail = self.create_block();
                self.lower_condition(cond, ok, fail)?;
                self.set_block(fail);
                self.emit_die(ERR_UNKNOWN);
                self.set_block(ok);
            }
        }
        Ok(())
    }

    fn lower_assignment(&mut self, target: &LValue, value: ValueId) -> Result<(), CompileError> {
        match target {
            LValue::Var(name, _) => {
                let slot = self.variable_slot(name)?;
                self.emit(InstKind::Store { dest: slot, src: value });
            }
            LValue::Member { obj, index, .. } => {
                let base = self.lower_expr(obj)?;
                let offset = self.raw_const(FIELD_BASE_OFFSET * (*index as i64 + 1));
                self.emit(InstKind::IndexedStore {
                    base,
                    offset,
                    src: value,
                });
            }
            LValue::Index { array, index, .. } => {
                let base = self.lower_expr(array)?;
                let offset = self.element_offset(index)?;
                self.emit(InstKind::IndexedStore {
                    base,
                    offset,
                    src: value,
                });
            }
        }
        Ok(())
    }

    fn variable_slot(&mut self, name: &str) -> Result<ValueId, CompileError> {
        if let Some(&local) = self.locals.get(name) {
            return Ok(local);
        }
        if let Some(&arg) = self.args.get(name) {
            return Ok(arg);
        }
        if let Some(&global) = self.globals.get(name) {
            return Ok(global);
        }
        Err(CodegenError::new(format!("undefined variable {}", name)).into())
    }

    /// Byte offset of element `index` of an array: the header word
    /// plus one word per element.
    fn element_offset(&mut self, index: &Expr) -> Result<ValueId, CompileError> {
        let tagged = self.lower_expr(index)?;
        let raw = self.untag(tagged);
        let one = self.raw_const(1);
        let words = self.ctx.create_temp(self.func, ValueType::I64);
        self.emit(InstKind::BinaryOp {
            dest: words,
            op: BinOp::Add,
            lhs: raw,
            rhs: one,
        });
        let size = self.raw_const(WORD_SIZE);
        let bytes = self.ctx.create_temp(self.func, ValueType::I64);
        self.emit(InstKind::BinaryOp {
            dest: bytes,
            op: BinOp::Mul,
            lhs: words,
            rhs: size,
        });
        Ok(bytes)
    }

    /* MATCH */

    fn lower_match(&mut self, scrutinee: &Expr, arms: &[MatchArm]) -> Result<(), CompileError> {
        let scrutinee_ty = self.concrete(&scrutinee.ty());
        let data = match &scrutinee_ty {
            Type::Adt(name, _) => self
                .program
                .datatypes
                .iter()
                .find(|d| d.name == *name)
                .ok_or_else(|| CodegenError::new(format!("unknown datatype {}", name)))?,
            other => {
                return Err(
                    CodegenError::new(format!("match on non-datatype {:?}", other)).into(),
                )
            }
        };
        let exhaustive = arms.len() == data.constructors.len();

        let subject = self.lower_expr(scrutinee)?;

        // Tag dispatch: load the header word and mask the discriminant.
        let zero = self.raw_const(0);
        let header = self.ctx.create_temp(self.func, ValueType::I64);
        self.emit(InstKind::IndexedLoad {
            dest: header,
            base: subject,
            offset: zero,
        });
        let mask = self.raw_const(TAG_MASK);
        let disc = self.ctx.create_temp(self.func, ValueType::I64);
        self.emit(InstKind::BinaryOp {
            dest: disc,
            op: BinOp::And,
            lhs: header,
            rhs: mask,
        });

        let join = self.create_block();
        let mut arm_blocks = Vec::with_capacity(arms.len());

        for (i, arm) in arms.iter().enumerate() {
            let (_, discriminant, _) = self
                .program
                .constructor(&arm.ctor)
                .ok_or_else(|| CodegenError::new(format!("unknown constructor {}", arm.ctor)))?;
            let arm_block = self.create_block();
            arm_blocks.push(arm_block);

            let last = i + 1 == arms.len();
            if last && exhaustive {
                // The remaining constructor needs no test.
                self.emit(InstKind::Jump { target: arm_block });
            } else {
                let next = self.create_block();
                let expected = self.raw_const(discriminant as i64);
                self.emit(InstKind::ConditionalJump {
                    op: CmpOp::Eq,
                    lhs: disc,
                    rhs: expected,
                    if_true: arm_block,
                    if_false: next,
                });
                self.set_block(next);
            }
        }

        if !exhaustive {
            // Fall-through of an incomplete match panics.
            self.emit_die(ERR_UNKNOWN);
        }

        for (arm, arm_block) in arms.iter().zip(arm_blocks) {
            self.set_block(arm_block);

            let (_, _, ctor) = self.program.constructor(&arm.ctor).expect("checked above");
            let fields = ctor.fields.clone();
            for (j, binder) in arm.binders.iter().enumerate() {
                let vt = self.value_type(&fields[j])?;
                let offset = self.raw_const(FIELD_BASE_OFFSET * (j as i64 + 1));
                let field = self.ctx.create_temp(self.func, vt);
                self.emit(InstKind::IndexedLoad {
                    dest: field,
                    base: subject,
                    offset,
                });
                let local = self.ctx.create_local(self.func, vt, binder);
                self.locals.insert(binder.clone(), local);
                self.emit(InstKind::Store { dest: local, src: field });
            }

            for s in &arm.body {
                self.lower_stmt(s)?;
            }
            if self.ctx.terminator(self.block).is_none() {
                self.emit(InstKind::Jump { target: join });
            }
        }

        self.set_block(join);
        Ok(())
    }

    /* CONDITIONS */

    /// Lower a boolean expression as control flow into `if_true` /
    /// `if_false`, short-circuiting without materializing a value.
    fn lower_condition(
        &mut self,
        cond: &Expr,
        if_true: ValueId,
        if_false: ValueId,
    ) -> Result<(), CompileError> {
        match cond {
            Expr::Bool(true) => self.emit(InstKind::Jump { target: if_true }),
            Expr::Bool(false) => self.emit(InstKind::Jump { target: if_false }),
            Expr::Not(inner) => self.lower_condition(inner, if_false, if_true)?,
            Expr::Compare { op, lhs, rhs } => {
                let lhs = self.lower_expr(lhs)?;
                let rhs = self.lower_expr(rhs)?;
                self.emit(InstKind::ConditionalJump {
                    op: cmp_op(*op),
                    lhs,
                    rhs,
                    if_true,
                    if_false,
                });
            }
            Expr::Logical {
                op: LogicalOp::And,
                lhs,
                rhs,
            } => {
                let mid = self.create_block();
                self.lower_condition(lhs, mid, if_false)?;
                self.set_block(mid);
                self.lower_condition(rhs, if_true, if_false)?;
            }
            Expr::Logical {
                op: LogicalOp::Or,
                lhs,
                rhs,
            } => {
                let mid = self.create_block();
                self.lower_condition(lhs, if_true, mid)?;
                self.set_block(mid);
                self.lower_condition(rhs, if_true, if_false)?;
            }
            other => {
                let value = self.lower_expr(other)?;
                self.emit(InstKind::JumpIf {
                    cond: value,
                    if_true,
                    if_false,
                });
            }
        }
        Ok(())
    }

    /// Materialize a boolean expression as 0/1 through a join.
    fn materialize_condition(&mut self, cond: &Expr) -> Result<ValueId, CompileError> {
        let name = self.fresh_name("cmp");
        let slot = self.ctx.create_local(self.func, ValueType::I64, &name);

        let true_block = self.create_block();
        let false_block = self.create_block();
        let join = self.create_block();

        self.lower_condition(cond, true_block, false_block)?;

        self.set_block(true_block);
        let t = self.ctx.const_true;
        self.emit(InstKind::Store { dest: slot, src: t });
        self.emit(InstKind::Jump { target: join });

        self.set_block(false_block);
        let f = self.ctx.const_false;
        self.emit(InstKind::Store { dest: slot, src: f });
        self.emit(InstKind::Jump { target: join });

        self.set_block(join);
        Ok(self.load_slot(slot))
    }

    /* EXPRESSIONS */

    fn lower_expr(&mut self, expr: &Expr) -> Result<ValueId, CompileError> {
        match expr {
            Expr::Unit => Ok(self.raw_const(0)),
            Expr::Int(n) => Ok(self.tagged_const(*n)),
            Expr::SizedInt(v, it) => Ok(self.ctx.const_int(ValueType::Integer(*it), *v)),
            Expr::Bool(b) => Ok(if *b {
                self.ctx.const_true
            } else {
                self.ctx.const_false
            }),
            Expr::Str(s) => Ok(self.static_string(s)),
            Expr::Nil(_) => Ok(self.ctx.const_int(ValueType::BoxOrInt, 0)),
            Expr::Var(name, ty) => self.lower_var(name, ty),
            Expr::Binary { op, lhs, rhs, ty } => self.lower_binary(*op, lhs, rhs, ty),
            Expr::Compare { .. } | Expr::Logical { .. } | Expr::Not(_) => {
                self.materialize_condition(expr)
            }
            Expr::Neg(inner) => {
                let ty = inner.ty();
                let zero = Expr::Int(0);
                let zero_sized;
                let lhs = match self.concrete(&ty) {
                    Type::Int => &zero,
                    Type::Sized(it) => {
                        zero_sized = Expr::SizedInt(0, it);
                        &zero_sized
                    }
                    other => {
                        return Err(
                            CodegenError::new(format!("negation of {:?}", other)).into()
                        )
                    }
                };
                self.lower_binary(AstBinOp::Sub, lhs, inner, &ty)
            }
            Expr::Cast { expr, to } => self.lower_cast(expr, to),
            Expr::Call {
                callee,
                type_args,
                args,
                ty,
                span,
            } => self.lower_call(callee, type_args, args, ty, *span),
            Expr::CallIndirect { closure, args, ty } => {
                let closure = self.lower_expr(closure)?;
                let zero = self.raw_const(0);
                let code = self.ctx.create_temp(self.func, ValueType::CodeAddress);
                self.emit(InstKind::IndexedLoad {
                    dest: code,
                    base: closure,
                    offset: zero,
                });
                let mut call_args = Vec::with_capacity(args.len() + 1);
                for arg in args {
                    call_args.push(self.lower_expr(arg)?);
                }
                // The closure is the implicit last argument.
                call_args.push(closure);
                let vt = self.value_type(ty)?;
                let dest = self.ctx.create_temp(self.func, vt);
                self.emit(InstKind::Call {
                    dest,
                    target: code,
                    args: call_args,
                    regpass: false,
                    ccall: false,
                });
                Ok(dest)
            }
            Expr::MethodCall {
                trait_name,
                method,
                recv,
                args,
                ty,
                span,
            } => {
                let recv_ty = self.concrete(&recv.ty());
                if !recv_ty.is_concrete() {
                    let mut vars = Vec::new();
                    recv_ty.free_vars(&mut vars);
                    return Err(MonomorphizationError { span: *span, vars }.into());
                }
                let def = self
                    .program
                    .resolve_method(trait_name, &recv_ty, method)
                    .ok_or_else(|| {
                        CodegenError::new(format!(
                            "no implementation of {}::{} for receiver",
                            trait_name, method
                        ))
                    })?
                    .clone();
                let assignment = self.resolve_assignment(&def.type_params, &TypeAssignment::new(), *span)?;
                let target = self.instantiate(&def, assignment)?;

                let mut call_args = Vec::with_capacity(args.len() + 1);
                call_args.push(self.lower_expr(recv)?);
                for arg in args {
                    call_args.push(self.lower_expr(arg)?);
                }
                let vt = self.value_type(ty)?;
                let dest = self.ctx.create_temp(self.func, vt);
                self.emit(InstKind::Call {
                    dest,
                    target,
                    args: call_args,
                    regpass: false,
                    ccall: false,
                });
                Ok(dest)
            }
            Expr::Construct {
                ctor,
                type_args,
                args,
                ..
            } => {
                let mut resolved = TypeAssignment::new();
                for (var, ty) in type_args {
                    resolved.insert(*var, ty.apply(&self.type_ctx));
                }
                let (discriminant, fields) = if let Some((_, disc, def)) =
                    self.program.constructor(ctor)
                {
                    (disc, def.fields.clone())
                } else if let Some(record) = self.program.record(ctor) {
                    (0, record.fields.iter().map(|f| f.ty.clone()).collect())
                } else {
                    return Err(
                        CodegenError::new(format!("unknown constructor {}", ctor)).into(),
                    );
                };
                let target = self.constructor_fn(ctor, &resolved, discriminant, &fields)?;

                let mut call_args = Vec::with_capacity(args.len());
                for arg in args {
                    call_args.push(self.lower_expr(arg)?);
                }
                let dest = self.ctx.create_temp(self.func, ValueType::BoxOrInt);
                self.emit(InstKind::Call {
                    dest,
                    target,
                    args: call_args,
                    regpass: false,
                    ccall: false,
                });
                Ok(dest)
            }
            Expr::Member { obj, index, ty } => {
                let base = self.lower_expr(obj)?;
                let offset = self.raw_const(FIELD_BASE_OFFSET * (*index as i64 + 1));
                let vt = self.value_type(ty)?;
                let dest = self.ctx.create_temp(self.func, vt);
                self.emit(InstKind::IndexedLoad {
                    dest,
                    base,
                    offset,
                });
                Ok(dest)
            }
            Expr::Index { array, index, ty } => {
                let base = self.lower_expr(array)?;
                let offset = self.element_offset(index)?;
                let vt = self.value_type(ty)?;
                let dest = self.ctx.create_temp(self.func, vt);
                self.emit(InstKind::IndexedLoad {
                    dest,
                    base,
                    offset,
                });
                Ok(dest)
            }
            Expr::Lambda {
                params,
                captures,
                body,
                ..
            } => {
                let name = format!("lambda${}", self.lambda_counter);
                self.lambda_counter += 1;
                let func = self.ctx.create_function(&name);

                let saved = self.type_ctx.clone();
                self.bind_params(func, params, &saved)?;
                let env = self.ctx.create_argument(ValueType::BoxOrInt, "$env");
                self.ctx.add_param(func, env);

                self.worklist.push_back(WorkItem::Lambda {
                    params: params.clone(),
                    captures: captures.clone(),
                    body: (**body).clone(),
                    assignment: saved,
                    func,
                });

                self.make_closure(func, captures)
            }
        }
    }

    fn lower_var(&mut self, name: &str, ty: &Type) -> Result<ValueId, CompileError> {
        if self.locals.contains_key(name) || self.args.contains_key(name) || self.globals.contains_key(name)
        {
            let slot = self.variable_slot(name)?;
            return Ok(self.load_slot(slot));
        }

        // A top-level function used as a value closes over nothing.
        if let Some(def) = self.program.function(name) {
            if !def.type_params.is_empty() {
                return Err(CodegenError::new(format!(
                    "generic function {} used as a value",
                    name
                ))
                .into());
            }
            let def = def.clone();
            let target = self.instantiate(&def, TypeAssignment::new())?;
            return self.make_closure(target, &[]);
        }

        let _ = ty;
        Err(CodegenError::new(format!("undefined variable {}", name)).into())
    }

    /// Allocate a closure block: the code address followed by one word
    /// per captured variable.
    fn make_closure(
        &mut self,
        target: ValueId,
        captures: &[(String, Type)],
    ) -> Result<ValueId, CompileError> {
        let size = WORD_SIZE * (1 + captures.len() as i64);
        let size = self.raw_const(size);
        let closure = self.gc_allocate(size);

        let zero = self.raw_const(0);
        self.emit(InstKind::IndexedStore {
            base: closure,
            offset: zero,
            src: target,
        });
        for (i, (name, _)) in captures.iter().enumerate() {
            let slot = self.variable_slot(name)?;
            let value = self.load_slot(slot);
            let offset = self.raw_const(FIELD_BASE_OFFSET * (i as i64 + 1));
            self.emit(InstKind::IndexedStore {
                base: closure,
                offset,
                src: value,
            });
        }
        Ok(closure)
    }

    fn lower_binary(
        &mut self,
        op: AstBinOp,
        lhs: &Expr,
        rhs: &Expr,
        ty: &Type,
    ) -> Result<ValueId, CompileError> {
        let op = bin_op(op);
        match self.concrete(ty) {
            Type::Int => {
                let lhs = self.lower_expr(lhs)?;
                let rhs = self.lower_expr(rhs)?;
                let lhs = self.untag(lhs);
                let rhs = self.untag(rhs);
                let dest = self.ctx.create_temp(self.func, ValueType::I64);
                self.emit(InstKind::BinaryOp { dest, op, lhs, rhs });
                Ok(self.tag(dest))
            }
            Type::Sized(it) => {
                if op == BinOp::Shr && !it.signed {
                    // Logical right shift is not implemented by the
                    // back end; reject it here rather than emit SAR.
                    return Err(
                        CodegenError::new("unsigned right shift is not supported").into()
                    );
                }
                let lhs = self.lower_expr(lhs)?;
                let rhs = self.lower_expr(rhs)?;
                let dest = self.ctx.create_temp(self.func, ValueType::Integer(it));
                self.emit(InstKind::BinaryOp { dest, op, lhs, rhs });
                Ok(dest)
            }
            other => Err(CodegenError::new(format!(
                "binary operation on non-integer type {:?}",
                other
            ))
            .into()),
        }
    }

    fn lower_cast(&mut self, expr: &Expr, to: &Type) -> Result<ValueId, CompileError> {
        let from = self.concrete(&expr.ty());
        let to = self.concrete(to);
        let value = self.lower_expr(expr)?;

        match (&from, &to) {
            _ if from == to => Ok(value),
            (Type::Int, Type::Sized(it)) => {
                let raw = self.untag(value);
                let dest = self.ctx.create_temp(self.func, ValueType::Integer(*it));
                self.emit(InstKind::Copy { dest, src: raw });
                Ok(dest)
            }
            (Type::Sized(_), Type::Int) => {
                let wide = self.ctx.create_temp(self.func, ValueType::I64);
                self.emit(InstKind::Copy { dest: wide, src: value });
                Ok(self.tag(wide))
            }
            (Type::Sized(_), Type::Sized(it)) => {
                let dest = self.ctx.create_temp(self.func, ValueType::Integer(*it));
                self.emit(InstKind::Copy { dest, src: value });
                Ok(dest)
            }
            (Type::Bool, Type::Int) => Ok(self.tag(value)),
            (from, to) => Err(CodegenError::new(format!(
                "unsupported cast from {:?} to {:?}",
                from, to
            ))
            .into()),
        }
    }

    fn lower_call(
        &mut self,
        callee: &str,
        type_args: &TypeAssignment,
        args: &[Expr],
        ty: &Type,
        span: Span,
    ) -> Result<ValueId, CompileError> {
        if let Some(result) = self.lower_builtin(callee, args)? {
            return Ok(result);
        }

        if let Some(&target) = self.externs.get(callee) {
            let mut call_args = Vec::with_capacity(args.len());
            for arg in args {
                call_args.push(self.lower_expr(arg)?);
            }
            let vt = self.value_type(ty)?;
            let dest = self.ctx.create_temp(self.func, vt);
            self.emit(InstKind::Call {
                dest,
                target,
                args: call_args,
                regpass: true,
                ccall: true,
            });
            return Ok(dest);
        }

        if let Some(def) = self.program.function(callee) {
            let def = def.clone();
            let assignment = self.resolve_assignment(&def.type_params, type_args, span)?;
            let target = self.instantiate(&def, assignment)?;

            let mut call_args = Vec::with_capacity(args.len());
            for arg in args {
                call_args.push(self.lower_expr(arg)?);
            }
            let vt = self.value_type(ty)?;
            let dest = self.ctx.create_temp(self.func, vt);
            self.emit(InstKind::Call {
                dest,
                target,
                args: call_args,
                regpass: false,
                ccall: false,
            });
            return Ok(dest);
        }

        // A closure bound to a variable, called by name.
        if self.locals.contains_key(callee) || self.args.contains_key(callee) {
            let closure = Expr::Var(callee.to_string(), Type::Unit);
            return self.lower_expr(&Expr::CallIndirect {
                closure: Box::new(closure),
                args: args.to_vec(),
                ty: ty.clone(),
            });
        }

        Err(CodegenError::new(format!("call to undefined function {}", callee)).into())
    }

    /// List, array, and I/O primitives lower inline.
    fn lower_builtin(&mut self, callee: &str, args: &[Expr]) -> Result<Option<ValueId>, CompileError> {
        match callee {
            "print" => {
                let value = self.lower_expr(&args[0])?;
                let raw = self.untag(value);
                let dest = self.ctx.create_temp(self.func, ValueType::I64);
                let target = self.runtime["print"];
                self.emit(InstKind::Call {
                    dest,
                    target,
                    args: vec![raw],
                    regpass: true,
                    ccall: true,
                });
                Ok(Some(dest))
            }
            "cons" => {
                let head = self.lower_expr(&args[0])?;
                let rest = self.lower_expr(&args[1])?;
                let dest = self.ctx.create_temp(self.func, ValueType::BoxOrInt);
                let target = self.runtime["cons"];
                self.emit(InstKind::Call {
                    dest,
                    target,
                    args: vec![head, rest],
                    regpass: true,
                    ccall: true,
                });
                Ok(Some(dest))
            }
            "head" | "tail" => {
                let list = self.lower_expr(&args[0])?;
                let ok = self.create_block();
                let empty = self.create_block();
                let nil = self.ctx.const_int(ValueType::BoxOrInt, 0);
                self.emit(InstKind::ConditionalJump {
                    op: CmpOp::Eq,
                    lhs: list,
                    rhs: nil,
                    if_true: empty,
                    if_false: ok,
                });
                self.set_block(empty);
                self.emit_die(if callee == "head" {
                    ERR_HEAD_EMPTY
                } else {
                    ERR_TAIL_EMPTY
                });
                self.set_block(ok);
                // A cell is (value, next) from the returned pointer.
                let offset = self.raw_const(if callee == "head" { 0 } else { WORD_SIZE });
                let dest = self.ctx.create_temp(self.func, ValueType::BoxOrInt);
                self.emit(InstKind::IndexedLoad {
                    dest,
                    base: list,
                    offset,
                });
                Ok(Some(dest))
            }
            "len" => {
                let array = self.lower_expr(&args[0])?;
                let zero = self.raw_const(0);
                let dest = self.ctx.create_temp(self.func, ValueType::BoxOrInt);
                self.emit(InstKind::IndexedLoad {
                    dest,
                    base: array,
                    offset: zero,
                });
                Ok(Some(dest))
            }
            "arrayFill" => {
                let count_tagged = self.lower_expr(&args[0])?;
                let value = self.lower_expr(&args[1])?;
                let count = self.untag(count_tagged);

                let one = self.raw_const(1);
                let words = self.ctx.create_temp(self.func, ValueType::I64);
                self.emit(InstKind::BinaryOp {
                    dest: words,
                    op: BinOp::Add,
                    lhs: count,
                    rhs: one,
                });
                let word = self.raw_const(WORD_SIZE);
                let bytes = self.ctx.create_temp(self.func, ValueType::I64);
                self.emit(InstKind::BinaryOp {
                    dest: bytes,
                    op: BinOp::Mul,
                    lhs: words,
                    rhs: word,
                });
                let array = self.gc_allocate(bytes);

                let zero = self.raw_const(0);
                self.emit(InstKind::IndexedStore {
                    base: array,
                    offset: zero,
                    src: count_tagged,
                });
                let offset = self.raw_const(FIELD_BASE_OFFSET);
                self.emit(InstKind::Memset {
                    base: array,
                    offset,
                    count,
                    value,
                });
                Ok(Some(array))
            }
            _ => Ok(None),
        }
    }

    fn static_string(&mut self, contents: &str) -> ValueId {
        if let Some(&id) = self.strings.get(contents) {
            return id;
        }
        let name = format!("str${}", self.strings.len());
        let id = self.ctx.create_static_string(&name, contents);
        self.strings.insert(contents.to_string(), id);
        id
    }
}

fn bin_op(op: AstBinOp) -> BinOp {
    match op {
        AstBinOp::Add => BinOp::Add,
        AstBinOp::Sub => BinOp::Sub,
        AstBinOp::Mul => BinOp::Mul,
        AstBinOp::Div => BinOp::Div,
        AstBinOp::Mod => BinOp::Mod,
        AstBinOp::And => BinOp::And,
        AstBinOp::Shl => BinOp::Shl,
        AstBinOp::Shr => BinOp::Shr,
    }
}

fn cmp_op(op: AstCmpOp) -> CmpOp {
    match op {
        AstCmpOp::Eq => CmpOp::Eq,
        AstCmpOp::Ne => CmpOp::Ne,
        AstCmpOp::Lt => CmpOp::Lt,
        AstCmpOp::Le => CmpOp::Le,
        AstCmpOp::Gt => CmpOp::Gt,
        AstCmpOp::Ge => CmpOp::Ge,
    }
}

fn type_suffix(ty: &Type) -> String {
    match ty {
        Type::Unit => "Unit".to_string(),
        Type::Bool => "Bool".to_string(),
        Type::Int => "Int".to_string(),
        Type::Sized(it) => format!("{}{}", if it.signed { 'I' } else { 'U' }, it.bits),
        Type::Str => "Str".to_string(),
        Type::Array(t) => format!("Array_{}", type_suffix(t)),
        Type::List(t) => format!("List_{}", type_suffix(t)),
        Type::Func(..) => "Fn".to_string(),
        Type::Adt(name, args) | Type::Record(name, args) => {
            let mut out = name.clone();
            for arg in args {
                out.push('_');
                out.push_str(&type_suffix(arg));
            }
            out
        }
        Type::Var(v) => format!("t{}", v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::IntType;

    #[test]
    fn constructor_header_packs_discriminant_and_refmask() {
        let program = ast::Program::default();
        let mut ctx = IrContext::new();
        let mut builder = TacBuilder::new(&program, &mut ctx);

        let fields = vec![Type::Int, Type::List(Box::new(Type::Int)), Type::Sized(IntType::U8)];
        let tag = builder.constructor_tag("Cell", &TypeAssignment::new(), 3, &fields);

        // Field 1 is the only traced reference.
        assert_eq!(tag & TAG_MASK, 3);
        assert_eq!(tag >> REFMASK_SHIFT, 0b010);
    }

    #[test]
    fn instance_names_embed_type_arguments() {
        let mut assignment = TypeAssignment::new();
        assignment.insert(0, Type::Int);
        assignment.insert(1, Type::List(Box::new(Type::Bool)));
        assert_eq!(
            TacBuilder::instance_name("map", &assignment),
            "map$Int$List_Bool"
        );
        assert_eq!(TacBuilder::instance_name("main", &TypeAssignment::new()), "main");
    }
}
