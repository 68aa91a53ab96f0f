use std::collections::HashMap;

use crate::bytecode::{
    ClassRecord, CompiledUnit, Constant, DebugInfo, FunctionRecord, Instruction, Op,
    SourceLocation,
};
use crate::compiler::ast::{
    BinaryOp, CaseTest, EnumValue, Expr, Function, LValue, LambdaExpr, LogicalOp, Program, Stmt,
    StmtKind, SwitchCase, UnaryOp,
};
use crate::compiler::registers::RegisterAllocator;
use crate::compiler::types::{self, ComparisonKind, EnumRepr, Type};

/// A forward jump waiting for its label to be bound.
struct PendingJump {
    instruction: usize,
    label: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopKind {
    While,
    For,
    Switch,
}

/// Innermost entry governs `break`/`continue`.
struct LoopContext {
    continue_label: Option<String>,
    break_label: String,
    kind: LoopKind,
}

/// A function body queued for compilation after the current one finishes.
/// Lambdas and synthesized array helpers both go through this queue so the
/// register allocator is never shared across function boundaries.
enum DeferredBody {
    Lambda { index: usize, function: Function },
    ArrayHelper { index: usize, method: String },
}

/// Code generator that lowers a validated program to the register-machine
/// instruction stream. One instance per unit; all state is owned here and
/// mutated sequentially during a depth-first walk of the tree.
pub struct Codegen {
    instructions: Vec<Instruction>,
    comments: HashMap<usize, String>,
    constants: Vec<Constant>,
    labels: HashMap<String, usize>,
    pending_jumps: Vec<PendingJump>,
    next_label: usize,
    pub(crate) registers: RegisterAllocator,
    loop_stack: Vec<LoopContext>,
    functions: Vec<FunctionRecord>,
    function_indices: HashMap<String, usize>,
    classes: Vec<ClassRecord>,
    class_indices: HashMap<String, usize>,
    extern_methods: HashMap<String, usize>,
    enum_reprs: HashMap<String, EnumRepr>,
    enum_values: HashMap<(String, String), EnumValue>,
    globals: HashMap<String, u16>,
    /// Bindings of the current frame that hold capture cells
    boxed_bindings: HashMap<String, bool>,
    /// True while compiling a lambda body (register 1 is the lambda itself)
    in_lambda: bool,
    deferred: Vec<DeferredBody>,
    pub(crate) array_helpers: HashMap<String, usize>,
    next_lambda: usize,
    debug: DebugInfo,
    emit_debug: bool,
    current_location: Option<SourceLocation>,
    source_file: String,
}

impl Codegen {
    pub fn new(source_file: &str) -> Self {
        Self::with_debug(source_file, true)
    }

    /// Create a codegen without debug info (for release artifacts).
    pub fn without_debug(source_file: &str) -> Self {
        Self::with_debug(source_file, false)
    }

    fn with_debug(source_file: &str, emit_debug: bool) -> Self {
        let mut debug = DebugInfo::new();
        debug.files.push(source_file.to_string());
        Self {
            instructions: Vec::new(),
            comments: HashMap::new(),
            constants: Vec::new(),
            labels: HashMap::new(),
            pending_jumps: Vec::new(),
            next_label: 0,
            registers: RegisterAllocator::new(),
            loop_stack: Vec::new(),
            functions: Vec::new(),
            function_indices: HashMap::new(),
            classes: Vec::new(),
            class_indices: HashMap::new(),
            extern_methods: HashMap::new(),
            enum_reprs: HashMap::new(),
            enum_values: HashMap::new(),
            globals: HashMap::new(),
            boxed_bindings: HashMap::new(),
            in_lambda: false,
            deferred: Vec::new(),
            array_helpers: HashMap::new(),
            next_lambda: 0,
            debug,
            emit_debug,
            current_location: None,
            source_file: source_file.to_string(),
        }
    }

    /// Compile a whole validated program into a linear instruction stream.
    /// The entry function is compiled first so it starts at instruction 0.
    pub fn compile(mut self, program: &Program) -> Result<CompiledUnit, String> {
        self.register_enums(program);
        self.register_classes(program)?;
        self.register_globals(program);

        // Pre-register every declared function so call sites can resolve
        // indices before the target body is compiled.
        let main_index = self.declare_function(&program.main, &program.main.name)?;
        for func in &program.functions {
            self.declare_function(func, &func.name)?;
        }
        for class in &program.classes {
            if let Some(ctor) = &class.constructor {
                self.declare_function(ctor, &format!("{}.constructor", class.name))?;
            }
            for method in &class.methods {
                self.declare_function(method, &format!("{}.{}", class.name, method.name))?;
            }
            for method in &class.static_methods {
                self.declare_function(method, &format!("{}.{}", class.name, method.name))?;
            }
        }
        self.link_class_methods(program)?;

        // Bodies, entry first.
        self.compile_function_body(main_index, &program.main, true)?;
        let mut next = main_index + 1;
        for func in &program.functions {
            self.compile_function_body(next, func, false)?;
            next += 1;
        }
        for class in &program.classes {
            let methods = class
                .constructor
                .iter()
                .chain(class.methods.iter())
                .chain(class.static_methods.iter());
            for method in methods {
                self.compile_function_body(next, method, false)?;
                next += 1;
            }
        }

        // Lambdas and helpers queued while lowering the bodies above; the
        // queue can grow while it drains (nested lambdas).
        while let Some(deferred) = self.deferred.pop() {
            match deferred {
                DeferredBody::Lambda { index, function } => {
                    self.compile_lambda_body(index, &function)?;
                }
                DeferredBody::ArrayHelper { index, method } => {
                    self.compile_array_helper_body(index, &method)?;
                }
            }
        }

        self.resolve_pending_jumps()?;

        Ok(CompiledUnit {
            source_file: self.source_file,
            instructions: self.instructions,
            comments: self.comments,
            constants: self.constants,
            functions: self.functions,
            classes: self.classes,
            global_count: self.globals.len(),
            debug: self.debug,
            emit_debug: self.emit_debug,
        })
    }

    // ========================
    // Symbol registration
    // ========================

    fn register_enums(&mut self, program: &Program) {
        for decl in &program.enums {
            self.enum_reprs.insert(decl.name.clone(), decl.repr);
            for member in &decl.members {
                self.enum_values.insert(
                    (decl.name.clone(), member.name.clone()),
                    member.value.clone(),
                );
            }
        }
    }

    fn register_classes(&mut self, program: &Program) -> Result<(), String> {
        for class in &program.classes {
            if class.fields.len() > u8::MAX as usize {
                return Err(format!(
                    "class '{}' has more than {} fields",
                    class.name,
                    u8::MAX
                ));
            }
            let index = self.classes.len();
            self.class_indices.insert(class.name.clone(), index);
            self.classes.push(ClassRecord {
                name: class.name.clone(),
                fields: class.fields.iter().map(|f| f.name.clone()).collect(),
                methods: Vec::new(),
                is_extern: false,
            });
        }
        for class in &program.extern_classes {
            let index = self.classes.len();
            self.class_indices.insert(class.name.clone(), index);
            for method in &class.methods {
                self.extern_methods.insert(
                    format!("{}.{}", class.name, method.name),
                    method.param_count,
                );
            }
            self.classes.push(ClassRecord {
                name: class.name.clone(),
                fields: Vec::new(),
                methods: Vec::new(),
                is_extern: true,
            });
        }
        Ok(())
    }

    fn link_class_methods(&mut self, program: &Program) -> Result<(), String> {
        for class in &program.classes {
            let class_index = self.class_indices[&class.name];
            let methods = class
                .constructor
                .iter()
                .map(|c| ("constructor".to_string(), c))
                .chain(class.methods.iter().map(|m| (m.name.clone(), m)))
                .chain(class.static_methods.iter().map(|m| (m.name.clone(), m)));
            for (name, _method) in methods {
                let key = format!("{}.{}", class.name, name);
                let func_index = *self
                    .function_indices
                    .get(&key)
                    .ok_or_else(|| format!("missing method metadata for '{}'", key))?;
                self.classes[class_index].methods.push((name, func_index));
            }
        }
        Ok(())
    }

    fn register_globals(&mut self, program: &Program) {
        for (slot, global) in program.globals.iter().enumerate() {
            self.globals.insert(global.name.clone(), slot as u16);
        }
    }

    fn declare_function(&mut self, function: &Function, key: &str) -> Result<usize, String> {
        if self.function_indices.contains_key(key) {
            return Err(format!("duplicate function '{}'", key));
        }
        let index = self.functions.len();
        self.function_indices.insert(key.to_string(), index);
        self.functions.push(FunctionRecord {
            name: key.to_string(),
            address: 0,
            end_address: 0,
            param_count: function.params.len(),
            register_count: 0,
            capture_count: 0,
            has_receiver: function.has_receiver,
        });
        Ok(index)
    }

    pub(crate) fn function_index(&self, key: &str) -> Result<usize, String> {
        self.function_indices
            .get(key)
            .copied()
            .ok_or_else(|| format!("missing call-dispatch metadata for '{}'", key))
    }

    // ========================
    // Function bodies
    // ========================

    fn compile_function_body(
        &mut self,
        index: usize,
        function: &Function,
        is_entry: bool,
    ) -> Result<(), String> {
        self.enter_frame(function, function.has_receiver, false)?;
        let start = self.instructions.len();
        self.functions[index].address = start;
        let debug_index = if self.emit_debug {
            Some(
                self.debug
                    .open_function(&self.functions[index].name, start, function.params.len()),
            )
        } else {
            None
        };
        self.comments
            .insert(start, format!("fn {}", self.functions[index].name));

        for stmt in &function.body {
            self.compile_statement(stmt)?;
        }
        self.emit_implicit_return(function, start);
        if is_entry {
            self.emit(Op::Halt, 0, 0, 0);
        }

        self.finish_frame(index, function, start, debug_index);
        Ok(())
    }

    fn compile_lambda_body(&mut self, index: usize, function: &Function) -> Result<(), String> {
        self.enter_frame(function, true, true)?;
        let start = self.instructions.len();
        self.functions[index].address = start;
        let debug_index = if self.emit_debug {
            Some(
                self.debug
                    .open_function(&self.functions[index].name, start, function.params.len()),
            )
        } else {
            None
        };
        self.comments
            .insert(start, format!("fn {}", self.functions[index].name));

        for stmt in &function.body {
            self.compile_statement(stmt)?;
        }
        self.emit_implicit_return(function, start);

        self.finish_frame(index, function, start, debug_index);
        Ok(())
    }

    fn enter_frame(
        &mut self,
        function: &Function,
        has_receiver: bool,
        in_lambda: bool,
    ) -> Result<(), String> {
        let params: Vec<String> = function.params.iter().map(|p| p.name.clone()).collect();
        let locals: Vec<String> = function.locals.iter().map(|l| l.name.clone()).collect();
        self.registers.setup_function(&params, &locals, has_receiver)?;
        self.boxed_bindings.clear();
        for binding in function.params.iter().chain(function.locals.iter()) {
            self.boxed_bindings.insert(binding.name.clone(), binding.boxed);
        }
        self.in_lambda = in_lambda;
        self.current_location = None;

        // A boxed parameter is wrapped right after its normal
        // initialization, which for parameters is frame entry.
        for binding in &function.params {
            if binding.boxed {
                let reg = self.registers.variable(&binding.name)?;
                self.emit(Op::NewCell, reg, reg, 0);
            }
        }
        Ok(())
    }

    fn finish_frame(
        &mut self,
        index: usize,
        function: &Function,
        start: usize,
        debug_index: Option<usize>,
    ) {
        let end = self.instructions.len();
        self.functions[index].end_address = end;
        self.functions[index].register_count = self.registers.total_registers();
        if let Some(debug_index) = debug_index {
            self.debug.close_function(debug_index, end);
            self.debug.add_scope(start, end, None);
            for binding in function.params.iter().chain(function.locals.iter()) {
                if let Ok(reg) = self.registers.variable(&binding.name) {
                    self.debug
                        .add_variable(&binding.name, binding.ty.to_string(), reg, start, end);
                }
            }
        }
    }

    /// Void functions fall off their body; give them a `return null`.
    /// Only instructions emitted since `start` count: the last instruction
    /// of the previous function must not mask an empty body.
    fn emit_implicit_return(&mut self, function: &Function, start: usize) {
        let returns = self.instructions.len() > start
            && matches!(
                self.instructions.last(),
                Some(inst) if inst.op == Op::Return
            );
        if function.return_ty == Type::Void && !returns {
            self.emit(Op::LoadNull, 0, 0, 0);
            self.emit(Op::Return, 0, 0, 0);
        }
    }

    /// Queue a lambda for compilation and register its function record.
    pub(crate) fn declare_lambda(&mut self, lambda: &LambdaExpr) -> Result<usize, String> {
        let index = self.functions.len();
        let name = format!("lambda#{}", self.next_lambda);
        self.next_lambda += 1;
        self.functions.push(FunctionRecord {
            name,
            address: 0,
            end_address: 0,
            param_count: lambda.function.params.len(),
            register_count: 0,
            capture_count: lambda.captures.len(),
            has_receiver: true,
        });
        self.deferred.push(DeferredBody::Lambda {
            index,
            function: lambda.function.clone(),
        });
        Ok(index)
    }

    /// Queue a synthesized array helper routine, once per method name.
    pub(crate) fn declare_array_helper(&mut self, method: &str) -> Result<usize, String> {
        if let Some(&index) = self.array_helpers.get(method) {
            return Ok(index);
        }
        let param_count = if method == "reduce" { 3 } else { 2 };
        let index = self.functions.len();
        self.functions.push(FunctionRecord {
            name: format!("@array_{}", method),
            address: 0,
            end_address: 0,
            param_count,
            register_count: 0,
            capture_count: 0,
            has_receiver: false,
        });
        self.array_helpers.insert(method.to_string(), index);
        self.deferred.push(DeferredBody::ArrayHelper {
            index,
            method: method.to_string(),
        });
        Ok(index)
    }

    /// Open a synthesized frame (array helpers) with plain named slots.
    /// Returns the body start index and the open debug record, for the
    /// matching `finish_synthetic_frame`.
    pub(crate) fn begin_synthetic_frame(
        &mut self,
        index: usize,
        params: &[&str],
        locals: &[&str],
    ) -> Result<(usize, Option<usize>), String> {
        let params: Vec<String> = params.iter().map(|s| s.to_string()).collect();
        let locals: Vec<String> = locals.iter().map(|s| s.to_string()).collect();
        self.registers.setup_function(&params, &locals, false)?;
        self.boxed_bindings.clear();
        self.in_lambda = false;
        self.current_location = None;
        let start = self.instructions.len();
        self.functions[index].address = start;
        let name = self.functions[index].name.clone();
        self.comments.insert(start, format!("fn {}", name));
        let debug_index = if self.emit_debug {
            Some(self.debug.open_function(&name, start, params.len()))
        } else {
            None
        };
        Ok((start, debug_index))
    }

    pub(crate) fn finish_synthetic_frame(
        &mut self,
        index: usize,
        start: usize,
        debug_index: Option<usize>,
    ) {
        let end = self.instructions.len();
        self.functions[index].end_address = end;
        self.functions[index].register_count = self.registers.total_registers();
        if let Some(debug_index) = debug_index {
            self.debug.close_function(debug_index, end);
            self.debug.add_scope(start, end, None);
        }
    }

    pub(crate) fn extern_method_arity(&self, key: &str) -> Option<usize> {
        self.extern_methods.get(key).copied()
    }

    // ========================
    // Emission infrastructure
    // ========================

    pub(crate) fn emit(&mut self, op: Op, a: u8, b: u8, c: u8) -> usize {
        let index = self.instructions.len();
        self.instructions.push(Instruction::new(op, a, b, c));
        if self.emit_debug {
            if let Some(loc) = self.current_location {
                self.debug.map_instruction(index, loc);
            }
        }
        index
    }

    pub(crate) fn emit_bc(&mut self, op: Op, a: u8, bc: u16) -> usize {
        let index = self.emit(op, a, 0, 0);
        self.instructions[index].set_bc(bc);
        index
    }

    /// Append a jump with a placeholder offset and record it for the
    /// resolution pass.
    pub(crate) fn emit_jump(&mut self, op: Op, reg: u8, label: &str) -> usize {
        let index = self.emit(op, reg, 0, 0);
        self.pending_jumps.push(PendingJump {
            instruction: index,
            label: label.to_string(),
        });
        index
    }

    pub(crate) fn emit_move(&mut self, dst: u8, src: u8) {
        if dst != src {
            self.emit(Op::Move, dst, src, 0);
        }
    }

    pub(crate) fn comment(&mut self, index: usize, text: String) {
        self.comments.insert(index, text);
    }

    pub(crate) fn create_label(&mut self) -> String {
        let label = format!("L{}", self.next_label);
        self.next_label += 1;
        label
    }

    /// Bind a label to the current instruction index.
    pub(crate) fn bind_label(&mut self, label: &str) {
        self.labels.insert(label.to_string(), self.instructions.len());
    }

    /// Add a constant, reusing the index of a structurally equal entry.
    pub(crate) fn add_constant(&mut self, value: Constant) -> Result<u16, String> {
        if let Some(index) = self.constants.iter().position(|c| c == &value) {
            return Ok(index as u16);
        }
        let index = self.constants.len();
        if index > u16::MAX as usize {
            return Err("constant pool overflow".to_string());
        }
        self.constants.push(value);
        Ok(index as u16)
    }

    /// Patch every pending jump now that all labels in the unit are bound.
    /// Branch opcodes add their offset to the current instruction pointer,
    /// every other jump-bearing opcode to the following instruction; both
    /// bases are part of the wire contract.
    fn resolve_pending_jumps(&mut self) -> Result<(), String> {
        for jump in &self.pending_jumps {
            let target = *self
                .labels
                .get(&jump.label)
                .ok_or_else(|| format!("unresolved label '{}'", jump.label))?
                as i64;
            let source = jump.instruction as i64;
            let op = self.instructions[jump.instruction].op;
            let offset = if op.is_branch() {
                target - source
            } else {
                target - (source + 1)
            };
            if offset < i16::MIN as i64 || offset > i16::MAX as i64 {
                return Err(format!(
                    "jump to label '{}' is out of range: offset {} does not fit in 16 bits",
                    jump.label, offset
                ));
            }
            self.instructions[jump.instruction].set_bc(offset as i16 as u16);
        }
        self.pending_jumps.clear();
        Ok(())
    }

    // ========================
    // Statements
    // ========================

    fn compile_statement(&mut self, stmt: &Stmt) -> Result<(), String> {
        if let Some(loc) = stmt.loc {
            self.current_location = Some(loc);
        }
        match &stmt.kind {
            StmtKind::Let { name, init } => {
                let reg = self.registers.variable(name)?;
                let boxed = self.is_boxed(name);
                if boxed {
                    // Initialize the value, then wrap it in a cell shared
                    // with every closure that mutates this binding.
                    let value = self.registers.allocate_temporary()?;
                    self.compile_expr_into(init, value)?;
                    self.emit(Op::NewCell, reg, value, 0);
                    self.registers.free(value)?;
                } else {
                    self.compile_expr_into(init, reg)?;
                }
            }
            StmtKind::Assign { target, value } => self.compile_assign(target, value)?,
            StmtKind::Expr { expr } => {
                let (reg, owned) = self.compile_expr_operand(expr)?;
                self.free_if_owned(reg, owned)?;
            }
            StmtKind::If {
                cond,
                then_body,
                else_body,
            } => {
                let then_label = self.create_label();
                let else_label = self.create_label();
                let end_label = self.create_label();
                self.compile_condition(cond, &then_label, &else_label)?;
                self.bind_label(&then_label);
                for stmt in then_body {
                    self.compile_statement(stmt)?;
                }
                if let Some(else_body) = else_body {
                    self.emit_jump(Op::Jump, 0, &end_label);
                    self.bind_label(&else_label);
                    for stmt in else_body {
                        self.compile_statement(stmt)?;
                    }
                } else {
                    self.bind_label(&else_label);
                }
                self.bind_label(&end_label);
            }
            StmtKind::While { cond, body } => {
                let start_label = self.create_label();
                let body_label = self.create_label();
                let end_label = self.create_label();
                self.bind_label(&start_label);
                self.compile_condition(cond, &body_label, &end_label)?;
                self.bind_label(&body_label);
                self.loop_stack.push(LoopContext {
                    continue_label: Some(start_label.clone()),
                    break_label: end_label.clone(),
                    kind: LoopKind::While,
                });
                for stmt in body {
                    self.compile_statement(stmt)?;
                }
                self.loop_stack.pop();
                self.emit_jump(Op::Jump, 0, &start_label);
                self.bind_label(&end_label);
            }
            StmtKind::For {
                init,
                cond,
                update,
                body,
            } => {
                if let Some(init) = init {
                    self.compile_statement(init)?;
                }
                let cond_label = self.create_label();
                let body_label = self.create_label();
                let continue_label = self.create_label();
                let end_label = self.create_label();
                self.bind_label(&cond_label);
                if let Some(cond) = cond {
                    self.compile_condition(cond, &body_label, &end_label)?;
                }
                self.bind_label(&body_label);
                self.loop_stack.push(LoopContext {
                    continue_label: Some(continue_label.clone()),
                    break_label: end_label.clone(),
                    kind: LoopKind::For,
                });
                for stmt in body {
                    self.compile_statement(stmt)?;
                }
                self.loop_stack.pop();
                self.bind_label(&continue_label);
                if let Some(update) = update {
                    self.compile_statement(update)?;
                }
                self.emit_jump(Op::Jump, 0, &cond_label);
                self.bind_label(&end_label);
            }
            StmtKind::ForRange {
                var,
                start,
                end,
                inclusive,
                body,
            } => self.compile_for_range(var, start, end, *inclusive, body)?,
            StmtKind::ForIn {
                var,
                iterable,
                container: _,
                body,
            } => {
                let (collection, owned) = self.compile_expr_operand(iterable)?;
                let var_reg = self.registers.variable(var)?;
                let boxed = self.is_boxed(var);
                self.compile_iterator_loop(collection, var_reg, boxed, &mut |this| {
                    for stmt in body {
                        this.compile_statement(stmt)?;
                    }
                    Ok(())
                })?;
                self.free_if_owned(collection, owned)?;
            }
            StmtKind::Switch {
                discriminant,
                ty,
                cases,
                default,
            } => self.compile_switch(discriminant, ty, cases, default.as_deref())?,
            StmtKind::Break => {
                let label = match self.loop_stack.last() {
                    Some(ctx) => ctx.break_label.clone(),
                    None => return Err("break outside of a loop or switch".to_string()),
                };
                self.emit_jump(Op::Jump, 0, &label);
            }
            StmtKind::Continue => {
                let ctx = self
                    .loop_stack
                    .last()
                    .ok_or_else(|| "continue outside of a loop".to_string())?;
                if ctx.kind == LoopKind::Switch {
                    return Err("continue is not allowed inside a switch".to_string());
                }
                let label = ctx
                    .continue_label
                    .clone()
                    .ok_or_else(|| "continue outside of a loop".to_string())?;
                self.emit_jump(Op::Jump, 0, &label);
            }
            StmtKind::Return { value } => {
                if let Some(value) = value {
                    self.compile_expr_into(value, 0)?;
                } else {
                    self.emit(Op::LoadNull, 0, 0, 0);
                }
                self.emit(Op::Return, 0, 0, 0);
            }
            StmtKind::Block { body } => {
                for stmt in body {
                    self.compile_statement(stmt)?;
                }
            }
        }
        Ok(())
    }

    fn compile_assign(&mut self, target: &LValue, value: &Expr) -> Result<(), String> {
        match target {
            LValue::Local { name } => {
                let reg = self.registers.variable(name)?;
                if self.is_boxed(name) {
                    let tmp = self.registers.allocate_temporary()?;
                    self.compile_expr_into(value, tmp)?;
                    self.emit(Op::CellSet, reg, tmp, 0);
                    self.registers.free(tmp)?;
                } else {
                    self.compile_expr_into(value, reg)?;
                }
            }
            LValue::Global { name } => {
                let slot = self.global_slot(name)?;
                let (reg, owned) = self.compile_expr_operand(value)?;
                self.emit_bc(Op::StoreGlobal, reg, slot);
                self.free_if_owned(reg, owned)?;
            }
            LValue::Capture { index } => {
                // Boxed capture of the enclosing lambda: write through its cell.
                let cell = self.registers.allocate_temporary()?;
                self.emit_bc(Op::LoadCapture, cell, *index as u16);
                let tmp = self.registers.allocate_temporary()?;
                self.compile_expr_into(value, tmp)?;
                self.emit(Op::CellSet, cell, tmp, 0);
                self.registers.free(tmp)?;
                self.registers.free(cell)?;
            }
            LValue::Field {
                object,
                class: _,
                field,
            } => {
                let (obj, obj_owned) = self.compile_expr_operand(object)?;
                let (val, val_owned) = self.compile_expr_operand(value)?;
                self.emit(Op::SetField, obj, *field as u8, val);
                self.free_if_owned(val, val_owned)?;
                self.free_if_owned(obj, obj_owned)?;
            }
            LValue::Index {
                object,
                index,
                container,
            } => {
                let (obj, obj_owned) = self.compile_expr_operand(object)?;
                let (idx, idx_owned) = self.compile_expr_operand(index)?;
                let (val, val_owned) = self.compile_expr_operand(value)?;
                match container {
                    Type::Array(_) => {
                        self.emit(Op::ArraySet, obj, idx, val);
                    }
                    Type::Map(key, _) => {
                        let op = if self.key_is_integer(key) {
                            Op::MapSetInt
                        } else {
                            Op::MapSet
                        };
                        self.emit(op, obj, idx, val);
                    }
                    other => {
                        return Err(format!("cannot assign by index into '{}'", other));
                    }
                }
                self.free_if_owned(val, val_owned)?;
                self.free_if_owned(idx, idx_owned)?;
                self.free_if_owned(obj, obj_owned)?;
            }
        }
        Ok(())
    }

    fn compile_for_range(
        &mut self,
        var: &str,
        start: &Expr,
        end: &Expr,
        inclusive: bool,
        body: &[Stmt],
    ) -> Result<(), String> {
        let var_reg = self.registers.variable(var)?;
        let boxed = self.is_boxed(var);

        // Counter loop: start, end, and the increment are materialized once.
        let counter = if boxed {
            self.registers.allocate_temporary()?
        } else {
            var_reg
        };
        self.compile_expr_into(start, counter)?;
        if boxed {
            self.emit(Op::NewCell, var_reg, counter, 0);
        }
        let limit = self.registers.allocate_temporary()?;
        self.compile_expr_into(end, limit)?;
        let one = self.registers.allocate_temporary()?;
        self.emit_bc(Op::LoadInt, one, 1);

        let start_label = self.create_label();
        let continue_label = self.create_label();
        let end_label = self.create_label();

        self.bind_label(&start_label);
        let cmp = self.registers.allocate_temporary()?;
        let cmp_op = if inclusive { Op::LeInt } else { Op::LtInt };
        self.emit(cmp_op, cmp, counter, limit);
        self.emit_jump(Op::BranchFalse, cmp, &end_label);
        self.registers.free(cmp)?;

        self.loop_stack.push(LoopContext {
            continue_label: Some(continue_label.clone()),
            break_label: end_label.clone(),
            kind: LoopKind::For,
        });
        for stmt in body {
            self.compile_statement(stmt)?;
        }
        self.loop_stack.pop();

        self.bind_label(&continue_label);
        self.emit(Op::AddInt, counter, counter, one);
        if boxed {
            self.emit(Op::CellSet, var_reg, counter, 0);
        }
        self.emit_jump(Op::Jump, 0, &start_label);
        self.bind_label(&end_label);

        self.registers.free(one)?;
        self.registers.free(limit)?;
        if boxed {
            self.registers.free(counter)?;
        }
        Ok(())
    }

    /// Generic iterator-protocol lowering shared by `for`-over-collection
    /// and the synthesized array helpers. The callback lowers the body so
    /// nested control flow recurses through the normal statement path.
    pub(crate) fn compile_iterator_loop(
        &mut self,
        collection: u8,
        var_reg: u8,
        var_boxed: bool,
        body: &mut dyn FnMut(&mut Self) -> Result<(), String>,
    ) -> Result<(), String> {
        let iter = self.registers.allocate_temporary()?;
        self.emit(Op::IterNew, iter, collection, 0);

        let start_label = self.create_label();
        let end_label = self.create_label();

        self.bind_label(&start_label);
        let has = self.registers.allocate_temporary()?;
        self.emit(Op::IterHasNext, has, iter, 0);
        self.emit_jump(Op::BranchFalse, has, &end_label);
        self.registers.free(has)?;

        if var_boxed {
            let tmp = self.registers.allocate_temporary()?;
            self.emit(Op::IterNext, tmp, iter, 0);
            self.emit(Op::NewCell, var_reg, tmp, 0);
            self.registers.free(tmp)?;
        } else {
            self.emit(Op::IterNext, var_reg, iter, 0);
        }

        self.loop_stack.push(LoopContext {
            continue_label: Some(start_label.clone()),
            break_label: end_label.clone(),
            kind: LoopKind::For,
        });
        body(self)?;
        self.loop_stack.pop();

        self.emit_jump(Op::Jump, 0, &start_label);
        self.bind_label(&end_label);
        self.registers.free(iter)?;
        Ok(())
    }

    fn compile_switch(
        &mut self,
        discriminant: &Expr,
        ty: &Type,
        cases: &[SwitchCase],
        default: Option<&[Stmt]>,
    ) -> Result<(), String> {
        let reprs = self.enum_reprs.clone();
        let repr_of = |name: &str| reprs.get(name).copied();
        let disc_kind = types::comparison_kind(ty, repr_of)?;

        let disc = self.registers.allocate_temporary()?;
        self.compile_expr_into(discriminant, disc)?;

        let end_label = self.create_label();
        self.loop_stack.push(LoopContext {
            continue_label: None,
            break_label: end_label.clone(),
            kind: LoopKind::Switch,
        });

        // Cases are tried in declaration order; first match wins and every
        // body jumps to the end label.
        for case in cases {
            let next_label = self.create_label();
            match &case.test {
                CaseTest::Exact { value, ty } => {
                    let case_kind = types::comparison_kind(ty, repr_of)?;
                    let kind = types::reconcile(disc_kind, case_kind)?;
                    let (lhs, lhs_owned) = self.promote_operand(disc, disc_kind, kind)?;
                    let (value_reg, value_owned) = self.compile_expr_operand(value)?;
                    let (rhs, rhs_owned) =
                        self.promote_operand(value_reg, case_kind, kind)?;
                    let cmp = self.registers.allocate_temporary()?;
                    let op = Self::equality_op(kind);
                    self.emit(op, cmp, lhs, rhs);
                    self.emit_jump(Op::BranchFalse, cmp, &next_label);
                    self.registers.free(cmp)?;
                    if rhs_owned {
                        self.registers.free(rhs)?;
                    }
                    self.free_if_owned(value_reg, value_owned)?;
                    if lhs_owned {
                        self.registers.free(lhs)?;
                    }
                }
                CaseTest::Range {
                    lo,
                    hi,
                    ty,
                    inclusive,
                } => {
                    let case_kind = types::comparison_kind(ty, repr_of)?;
                    let kind = types::reconcile(disc_kind, case_kind)?;
                    let (subject, subject_owned) = self.promote_operand(disc, disc_kind, kind)?;

                    // lo <= d && d < hi (or <= for an inclusive upper bound)
                    let (lo_reg, lo_owned) = self.compile_expr_operand(lo)?;
                    let (lo_p, lo_p_owned) = self.promote_operand(lo_reg, case_kind, kind)?;
                    let cmp = self.registers.allocate_temporary()?;
                    self.emit(Self::less_equal_op(kind)?, cmp, lo_p, subject);
                    self.emit_jump(Op::BranchFalse, cmp, &next_label);
                    self.registers.free(cmp)?;
                    if lo_p_owned {
                        self.registers.free(lo_p)?;
                    }
                    self.free_if_owned(lo_reg, lo_owned)?;

                    let (hi_reg, hi_owned) = self.compile_expr_operand(hi)?;
                    let (hi_p, hi_p_owned) = self.promote_operand(hi_reg, case_kind, kind)?;
                    let cmp = self.registers.allocate_temporary()?;
                    let upper_op = if *inclusive {
                        Self::less_equal_op(kind)?
                    } else {
                        Self::less_than_op(kind)?
                    };
                    self.emit(upper_op, cmp, subject, hi_p);
                    self.emit_jump(Op::BranchFalse, cmp, &next_label);
                    self.registers.free(cmp)?;
                    if hi_p_owned {
                        self.registers.free(hi_p)?;
                    }
                    self.free_if_owned(hi_reg, hi_owned)?;
                    if subject_owned {
                        self.registers.free(subject)?;
                    }
                }
            }
            for stmt in &case.body {
                self.compile_statement(stmt)?;
            }
            self.emit_jump(Op::Jump, 0, &end_label);
            self.bind_label(&next_label);
        }

        if let Some(default) = default {
            for stmt in default {
                self.compile_statement(stmt)?;
            }
        }
        self.bind_label(&end_label);
        self.loop_stack.pop();
        self.registers.free(disc)?;
        Ok(())
    }

    // ========================
    // Conditions
    // ========================

    /// Flow-managed condition lowering: short-circuit operators and
    /// comparisons branch straight to the target labels instead of
    /// materializing a boolean into a named register.
    fn compile_condition(
        &mut self,
        expr: &Expr,
        true_label: &str,
        false_label: &str,
    ) -> Result<(), String> {
        match expr {
            Expr::Logical {
                op: LogicalOp::And,
                lhs,
                rhs,
            } => {
                let mid = self.create_label();
                self.compile_condition(lhs, &mid, false_label)?;
                self.bind_label(&mid);
                self.compile_condition(rhs, true_label, false_label)
            }
            Expr::Logical {
                op: LogicalOp::Or,
                lhs,
                rhs,
            } => {
                let mid = self.create_label();
                self.compile_condition(lhs, true_label, &mid)?;
                self.bind_label(&mid);
                self.compile_condition(rhs, true_label, false_label)
            }
            Expr::Unary {
                op: UnaryOp::Not,
                operand,
                ..
            } => self.compile_condition(operand, false_label, true_label),
            Expr::BoolLit(true) => {
                self.emit_jump(Op::Jump, 0, true_label);
                Ok(())
            }
            Expr::BoolLit(false) => {
                self.emit_jump(Op::Jump, 0, false_label);
                Ok(())
            }
            _ => {
                let (reg, owned) = self.compile_expr_operand(expr)?;
                self.emit_jump(Op::BranchTrue, reg, true_label);
                self.emit_jump(Op::Jump, 0, false_label);
                self.free_if_owned(reg, owned)?;
                Ok(())
            }
        }
    }

    // ========================
    // Expressions
    // ========================

    /// Evaluate an expression for use as an operand, avoiding a copy when
    /// it already lives in a stable register. Returns the register and
    /// whether the caller owns (and must free) it.
    pub(crate) fn compile_expr_operand(&mut self, expr: &Expr) -> Result<(u8, bool), String> {
        match expr {
            Expr::Local { name } if !self.is_boxed(name) => {
                Ok((self.registers.variable(name)?, false))
            }
            Expr::This => Ok((self.this_register()?, false)),
            _ => {
                let reg = self.registers.allocate_temporary()?;
                self.compile_expr_into(expr, reg)?;
                Ok((reg, true))
            }
        }
    }

    pub(crate) fn compile_expr_into(&mut self, expr: &Expr, dst: u8) -> Result<(), String> {
        match expr {
            Expr::IntLit(value) => self.emit_int_literal(*value, dst)?,
            Expr::FloatLit(value) | Expr::DoubleLit(value) => {
                let index = self.add_constant(Constant::Float(*value))?;
                self.emit_bc(Op::LoadConst, dst, index);
            }
            Expr::BoolLit(true) => {
                self.emit(Op::LoadTrue, dst, 0, 0);
            }
            Expr::BoolLit(false) => {
                self.emit(Op::LoadFalse, dst, 0, 0);
            }
            Expr::CharLit(value) => {
                let code = *value as u32;
                if code <= u16::MAX as u32 {
                    self.emit_bc(Op::LoadChar, dst, code as u16);
                } else {
                    let index = self.add_constant(Constant::Int(code as i64))?;
                    self.emit_bc(Op::LoadConst, dst, index);
                }
            }
            Expr::StrLit(value) => {
                let index = self.add_constant(Constant::Str(value.clone()))?;
                self.emit_bc(Op::LoadConst, dst, index);
            }
            Expr::NullLit => {
                self.emit(Op::LoadNull, dst, 0, 0);
            }
            Expr::Local { name } => {
                let reg = self.registers.variable(name)?;
                if self.is_boxed(name) {
                    self.emit(Op::CellGet, dst, reg, 0);
                } else {
                    self.emit_move(dst, reg);
                }
            }
            Expr::Global { name } => {
                let slot = self.global_slot(name)?;
                self.emit_bc(Op::LoadGlobal, dst, slot);
            }
            Expr::This => {
                let reg = self.this_register()?;
                self.emit_move(dst, reg);
            }
            Expr::Capture { index, boxed } => {
                self.emit_bc(Op::LoadCapture, dst, *index as u16);
                if *boxed {
                    self.emit(Op::CellGet, dst, dst, 0);
                }
            }
            Expr::Field {
                object,
                class: _,
                field,
            } => {
                let (obj, owned) = self.compile_expr_operand(object)?;
                self.emit(Op::GetField, dst, obj, *field as u8);
                self.free_if_owned(obj, owned)?;
            }
            Expr::Index {
                object,
                index,
                container,
            } => {
                let (obj, obj_owned) = self.compile_expr_operand(object)?;
                let (idx, idx_owned) = self.compile_expr_operand(index)?;
                match container {
                    Type::Array(_) => {
                        self.emit(Op::ArrayGet, dst, obj, idx);
                    }
                    Type::String => {
                        self.emit(Op::StringGet, dst, obj, idx);
                    }
                    Type::Map(key, _) => {
                        let op = if self.key_is_integer(key) {
                            Op::MapGetInt
                        } else {
                            Op::MapGet
                        };
                        self.emit(op, dst, obj, idx);
                    }
                    other => return Err(format!("cannot index into '{}'", other)),
                }
                self.free_if_owned(idx, idx_owned)?;
                self.free_if_owned(obj, obj_owned)?;
            }
            Expr::Unary { op, operand, ty } => match op {
                UnaryOp::Neg => {
                    let (src, owned) = self.compile_expr_operand(operand)?;
                    let neg = match Self::arith_kind(ty)? {
                        ComparisonKind::Int => Op::NegInt,
                        ComparisonKind::Float => Op::NegFloat,
                        ComparisonKind::Double => Op::NegDouble,
                        _ => return Err(format!("cannot negate a value of type '{}'", ty)),
                    };
                    self.emit(neg, dst, src, 0);
                    self.free_if_owned(src, owned)?;
                }
                UnaryOp::Not => {
                    let (src, owned) = self.compile_expr_operand(operand)?;
                    self.emit(Op::Not, dst, src, 0);
                    self.free_if_owned(src, owned)?;
                }
            },
            Expr::Binary {
                op,
                lhs,
                rhs,
                lhs_ty,
                rhs_ty,
            } => self.compile_binary(*op, lhs, rhs, lhs_ty, rhs_ty, dst)?,
            Expr::Logical { op, lhs, rhs } => {
                // In value position the short-circuit result is whatever
                // landed in dst.
                let end_label = self.create_label();
                self.compile_expr_into(lhs, dst)?;
                let branch = match op {
                    LogicalOp::And => Op::BranchFalse,
                    LogicalOp::Or => Op::BranchTrue,
                };
                self.emit_jump(branch, dst, &end_label);
                self.compile_expr_into(rhs, dst)?;
                self.bind_label(&end_label);
            }
            Expr::Call(call) => self.compile_call_into(call, dst)?,
            Expr::Invoke { callee, args } => self.compile_invoke_into(callee, args, dst)?,
            Expr::Lambda(lambda) => self.compile_lambda_into(lambda, dst)?,
            Expr::New { class, args } => self.compile_new_into(class, args, dst)?,
            Expr::NewCollection { ty } => match ty {
                Type::Map(key, _) => {
                    let op = if self.key_is_integer(key) {
                        Op::NewMapInt
                    } else {
                        Op::NewMap
                    };
                    self.emit(op, dst, 0, 0);
                }
                Type::Set(elem) => {
                    let op = if self.key_is_integer(elem) {
                        Op::NewSetInt
                    } else {
                        Op::NewSet
                    };
                    self.emit(op, dst, 0, 0);
                }
                other => {
                    return Err(format!("'{}' is not a constructible collection type", other));
                }
            },
            Expr::ArrayLit { elem_ty: _, elements } => {
                let len = elements.len().min(u16::MAX as usize) as u16;
                self.emit_bc(Op::NewArray, dst, len);
                for element in elements {
                    let (reg, owned) = self.compile_expr_operand(element)?;
                    self.emit(Op::ArrayPush, dst, reg, 0);
                    self.free_if_owned(reg, owned)?;
                }
            }
            Expr::EnumMember { enum_name, member } => {
                let value = self
                    .enum_values
                    .get(&(enum_name.clone(), member.clone()))
                    .cloned()
                    .ok_or_else(|| {
                        format!("unknown enum member '{}.{}'", enum_name, member)
                    })?;
                match value {
                    EnumValue::Int(value) => self.emit_int_literal(value, dst)?,
                    EnumValue::Str(value) => {
                        let index = self.add_constant(Constant::Str(value))?;
                        self.emit_bc(Op::LoadConst, dst, index);
                    }
                }
            }
            Expr::Cast { expr, from, to } => {
                let (src, owned) = self.compile_expr_operand(expr)?;
                match Self::conversion_op(from, to)? {
                    Some(op) => {
                        self.emit(op, dst, src, 0);
                    }
                    None => self.emit_move(dst, src),
                }
                self.free_if_owned(src, owned)?;
            }
        }
        Ok(())
    }

    fn compile_binary(
        &mut self,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
        lhs_ty: &Type,
        rhs_ty: &Type,
        dst: u8,
    ) -> Result<(), String> {
        let reprs = self.enum_reprs.clone();
        let repr_of = |name: &str| reprs.get(name).copied();
        let lhs_kind = types::comparison_kind(lhs_ty, repr_of)?;
        let rhs_kind = types::comparison_kind(rhs_ty, repr_of)?;
        let kind = types::reconcile(lhs_kind, rhs_kind)?;

        let (lhs_raw, lhs_raw_owned) = self.compile_expr_operand(lhs)?;
        let (lhs_reg, lhs_promoted) = self.promote_operand(lhs_raw, lhs_kind, kind)?;
        let (rhs_raw, rhs_raw_owned) = self.compile_expr_operand(rhs)?;
        let (rhs_reg, rhs_promoted) = self.promote_operand(rhs_raw, rhs_kind, kind)?;

        if op.is_comparison() {
            self.emit_comparison(op, kind, dst, lhs_reg, rhs_reg)?;
        } else {
            let opcode = Self::arithmetic_op(op, kind)?;
            self.emit(opcode, dst, lhs_reg, rhs_reg);
        }

        if rhs_promoted {
            self.registers.free(rhs_reg)?;
        }
        self.free_if_owned(rhs_raw, rhs_raw_owned)?;
        if lhs_promoted {
            self.registers.free(lhs_reg)?;
        }
        self.free_if_owned(lhs_raw, lhs_raw_owned)?;
        Ok(())
    }

    fn emit_comparison(
        &mut self,
        op: BinaryOp,
        kind: ComparisonKind,
        dst: u8,
        lhs: u8,
        rhs: u8,
    ) -> Result<(), String> {
        match kind {
            ComparisonKind::Int | ComparisonKind::Float | ComparisonKind::Double => {
                let opcode = match (op, kind) {
                    (BinaryOp::Eq, ComparisonKind::Int) => Op::EqInt,
                    (BinaryOp::Ne, ComparisonKind::Int) => Op::NeInt,
                    (BinaryOp::Lt, ComparisonKind::Int) => Op::LtInt,
                    (BinaryOp::Le, ComparisonKind::Int) => Op::LeInt,
                    (BinaryOp::Gt, ComparisonKind::Int) => Op::GtInt,
                    (BinaryOp::Ge, ComparisonKind::Int) => Op::GeInt,
                    (BinaryOp::Eq, ComparisonKind::Float) => Op::EqFloat,
                    (BinaryOp::Ne, ComparisonKind::Float) => Op::NeFloat,
                    (BinaryOp::Lt, ComparisonKind::Float) => Op::LtFloat,
                    (BinaryOp::Le, ComparisonKind::Float) => Op::LeFloat,
                    (BinaryOp::Gt, ComparisonKind::Float) => Op::GtFloat,
                    (BinaryOp::Ge, ComparisonKind::Float) => Op::GeFloat,
                    (BinaryOp::Eq, ComparisonKind::Double) => Op::EqDouble,
                    (BinaryOp::Ne, ComparisonKind::Double) => Op::NeDouble,
                    (BinaryOp::Lt, ComparisonKind::Double) => Op::LtDouble,
                    (BinaryOp::Le, ComparisonKind::Double) => Op::LeDouble,
                    (BinaryOp::Gt, ComparisonKind::Double) => Op::GtDouble,
                    (BinaryOp::Ge, ComparisonKind::Double) => Op::GeDouble,
                    _ => unreachable!(),
                };
                self.emit(opcode, dst, lhs, rhs);
            }
            ComparisonKind::Char => match op {
                BinaryOp::Eq => {
                    self.emit(Op::EqChar, dst, lhs, rhs);
                }
                BinaryOp::Ne => {
                    self.emit(Op::EqChar, dst, lhs, rhs);
                    self.emit(Op::Not, dst, dst, 0);
                }
                BinaryOp::Lt => {
                    self.emit(Op::LtChar, dst, lhs, rhs);
                }
                BinaryOp::Le => {
                    self.emit(Op::LeChar, dst, lhs, rhs);
                }
                BinaryOp::Gt => {
                    self.emit(Op::LtChar, dst, rhs, lhs);
                }
                BinaryOp::Ge => {
                    self.emit(Op::LeChar, dst, rhs, lhs);
                }
                _ => unreachable!(),
            },
            ComparisonKind::Bool => match op {
                BinaryOp::Eq => {
                    self.emit(Op::EqBool, dst, lhs, rhs);
                }
                BinaryOp::Ne => {
                    self.emit(Op::EqBool, dst, lhs, rhs);
                    self.emit(Op::Not, dst, dst, 0);
                }
                _ => return Err("bool values cannot be ordered".to_string()),
            },
            ComparisonKind::String => match op {
                BinaryOp::Eq => {
                    self.emit(Op::EqString, dst, lhs, rhs);
                }
                BinaryOp::Ne => {
                    self.emit(Op::NeString, dst, lhs, rhs);
                }
                _ => return Err("string values cannot be ordered with < or >".to_string()),
            },
            ComparisonKind::Object => match op {
                BinaryOp::Eq => {
                    self.emit(Op::EqObject, dst, lhs, rhs);
                }
                BinaryOp::Ne => {
                    self.emit(Op::EqObject, dst, lhs, rhs);
                    self.emit(Op::Not, dst, dst, 0);
                }
                _ => return Err("object references cannot be ordered".to_string()),
            },
        }
        Ok(())
    }

    fn arithmetic_op(op: BinaryOp, kind: ComparisonKind) -> Result<Op, String> {
        // String + is concatenation; everything else needs a numeric kind.
        if op == BinaryOp::Add && kind == ComparisonKind::String {
            return Ok(Op::ConcatString);
        }
        let opcode = match (op, kind) {
            (BinaryOp::Add, ComparisonKind::Int) => Op::AddInt,
            (BinaryOp::Sub, ComparisonKind::Int) => Op::SubInt,
            (BinaryOp::Mul, ComparisonKind::Int) => Op::MulInt,
            (BinaryOp::Div, ComparisonKind::Int) => Op::DivInt,
            (BinaryOp::Mod, ComparisonKind::Int) => Op::ModInt,
            (BinaryOp::Add, ComparisonKind::Float) => Op::AddFloat,
            (BinaryOp::Sub, ComparisonKind::Float) => Op::SubFloat,
            (BinaryOp::Mul, ComparisonKind::Float) => Op::MulFloat,
            (BinaryOp::Div, ComparisonKind::Float) => Op::DivFloat,
            (BinaryOp::Mod, ComparisonKind::Float) => Op::ModFloat,
            (BinaryOp::Add, ComparisonKind::Double) => Op::AddDouble,
            (BinaryOp::Sub, ComparisonKind::Double) => Op::SubDouble,
            (BinaryOp::Mul, ComparisonKind::Double) => Op::MulDouble,
            (BinaryOp::Div, ComparisonKind::Double) => Op::DivDouble,
            (BinaryOp::Mod, ComparisonKind::Double) => Op::ModDouble,
            (op, kind) => {
                return Err(format!(
                    "operator {:?} is not defined for {:?} operands",
                    op, kind
                ));
            }
        };
        Ok(opcode)
    }

    fn equality_op(kind: ComparisonKind) -> Op {
        match kind {
            ComparisonKind::Int => Op::EqInt,
            ComparisonKind::Float => Op::EqFloat,
            ComparisonKind::Double => Op::EqDouble,
            ComparisonKind::Char => Op::EqChar,
            ComparisonKind::Bool => Op::EqBool,
            ComparisonKind::String => Op::EqString,
            ComparisonKind::Object => Op::EqObject,
        }
    }

    fn less_than_op(kind: ComparisonKind) -> Result<Op, String> {
        match kind {
            ComparisonKind::Int => Ok(Op::LtInt),
            ComparisonKind::Float => Ok(Op::LtFloat),
            ComparisonKind::Double => Ok(Op::LtDouble),
            ComparisonKind::Char => Ok(Op::LtChar),
            other => Err(format!("range tests are not defined for {:?} values", other)),
        }
    }

    fn less_equal_op(kind: ComparisonKind) -> Result<Op, String> {
        match kind {
            ComparisonKind::Int => Ok(Op::LeInt),
            ComparisonKind::Float => Ok(Op::LeFloat),
            ComparisonKind::Double => Ok(Op::LeDouble),
            ComparisonKind::Char => Ok(Op::LeChar),
            other => Err(format!("range tests are not defined for {:?} values", other)),
        }
    }

    fn arith_kind(ty: &Type) -> Result<ComparisonKind, String> {
        match ty {
            Type::Int => Ok(ComparisonKind::Int),
            Type::Float => Ok(ComparisonKind::Float),
            Type::Double => Ok(ComparisonKind::Double),
            other => Err(format!("'{}' is not a numeric type", other)),
        }
    }

    /// Promote an operand register to the reconciled numeric kind. Returns
    /// the register holding the promoted value and whether it is a fresh
    /// temporary owned by the caller.
    fn promote_operand(
        &mut self,
        reg: u8,
        from: ComparisonKind,
        to: ComparisonKind,
    ) -> Result<(u8, bool), String> {
        if from == to {
            return Ok((reg, false));
        }
        let op = match (from, to) {
            (ComparisonKind::Char, ComparisonKind::Int) => Op::CharToInt,
            (ComparisonKind::Int, ComparisonKind::Float) => Op::IntToFloat,
            (ComparisonKind::Int, ComparisonKind::Double) => Op::IntToDouble,
            (ComparisonKind::Float, ComparisonKind::Double) => Op::FloatToDouble,
            (ComparisonKind::Char, ComparisonKind::Float) => {
                // Two hops through int.
                let tmp = self.registers.allocate_temporary()?;
                self.emit(Op::CharToInt, tmp, reg, 0);
                self.emit(Op::IntToFloat, tmp, tmp, 0);
                return Ok((tmp, true));
            }
            (ComparisonKind::Char, ComparisonKind::Double) => {
                let tmp = self.registers.allocate_temporary()?;
                self.emit(Op::CharToInt, tmp, reg, 0);
                self.emit(Op::IntToDouble, tmp, tmp, 0);
                return Ok((tmp, true));
            }
            (from, to) => {
                return Err(format!("no promotion from {:?} to {:?}", from, to));
            }
        };
        let tmp = self.registers.allocate_temporary()?;
        self.emit(op, tmp, reg, 0);
        Ok((tmp, true))
    }

    fn conversion_op(from: &Type, to: &Type) -> Result<Option<Op>, String> {
        let op = match (from, to) {
            (Type::Int, Type::Float) => Op::IntToFloat,
            (Type::Int, Type::Double) => Op::IntToDouble,
            (Type::Float, Type::Int) => Op::FloatToInt,
            (Type::Float, Type::Double) => Op::FloatToDouble,
            (Type::Double, Type::Int) => Op::DoubleToInt,
            (Type::Double, Type::Float) => Op::DoubleToFloat,
            (Type::Char, Type::Int) => Op::CharToInt,
            (Type::Int, Type::Char) => Op::IntToChar,
            (Type::Int, Type::String) => Op::IntToString,
            (Type::Float, Type::String) => Op::FloatToString,
            (Type::Double, Type::String) => Op::DoubleToString,
            (Type::Bool, Type::String) => Op::BoolToString,
            (Type::Char, Type::String) => Op::CharToString,
            (from, to) if from == to => return Ok(None),
            (from, to) => {
                return Err(format!("unsupported conversion from '{}' to '{}'", from, to));
            }
        };
        Ok(Some(op))
    }

    fn emit_int_literal(&mut self, value: i64, dst: u8) -> Result<(), String> {
        if value >= i16::MIN as i64 && value <= i16::MAX as i64 {
            self.emit_bc(Op::LoadInt, dst, value as i16 as u16);
        } else {
            let index = self.add_constant(Constant::Int(value))?;
            self.emit_bc(Op::LoadConst, dst, index);
        }
        Ok(())
    }

    fn compile_invoke_into(
        &mut self,
        callee: &Expr,
        args: &[Expr],
        dst: u8,
    ) -> Result<(), String> {
        let (lambda, lambda_owned) = self.compile_expr_operand(callee)?;
        let block_len = args.len().max(1);
        let base = self.registers.allocate_contiguous(block_len)?;
        for (i, arg) in args.iter().enumerate() {
            self.compile_expr_into(arg, (base as usize + i) as u8)?;
        }
        self.emit(Op::CallLambda, lambda, base, args.len() as u8);
        self.emit_move(dst, base);
        self.registers.free_contiguous(base, block_len)?;
        self.free_if_owned(lambda, lambda_owned)?;
        Ok(())
    }

    fn compile_lambda_into(&mut self, lambda: &LambdaExpr, dst: u8) -> Result<(), String> {
        let index = self.declare_lambda(lambda)?;
        let constant = self.add_constant(Constant::Function(index))?;

        // Stage captures contiguously: values are copied at creation time,
        // boxed bindings contribute their cell so both sides share storage.
        let block_len = lambda.captures.len().max(1);
        let base = self.registers.allocate_contiguous(block_len)?;
        for (i, capture) in lambda.captures.iter().enumerate() {
            let slot = (base as usize + i) as u8;
            let reg = self.registers.variable(&capture.name)?;
            self.emit_move(slot, reg);
        }
        let at = self.emit_bc(Op::NewLambda, base, constant);
        let name = self.functions[index].name.clone();
        self.comment(at, name);
        self.emit_move(dst, base);
        self.registers.free_contiguous(base, block_len)?;
        Ok(())
    }

    fn compile_new_into(&mut self, class: &str, args: &[Expr], dst: u8) -> Result<(), String> {
        let class_index = *self
            .class_indices
            .get(class)
            .ok_or_else(|| format!("missing class metadata for '{}'", class))?;
        let constant = self.add_constant(Constant::Class(class_index))?;
        let object = self.registers.allocate_temporary()?;
        self.emit_bc(Op::NewObject, object, constant);

        let ctor_key = format!("{}.constructor", class);
        if let Some(&ctor_index) = self.function_indices.get(&ctor_key) {
            let ctor_constant = self.add_constant(Constant::Function(ctor_index))?;
            let block_len = args.len() + 1;
            let base = self.registers.allocate_contiguous(block_len)?;
            self.emit_move(base, object);
            for (i, arg) in args.iter().enumerate() {
                self.compile_expr_into(arg, (base as usize + 1 + i) as u8)?;
            }
            self.emit_bc(Op::Call, base, ctor_constant);
            self.registers.free_contiguous(base, block_len)?;
        } else if !args.is_empty() {
            return Err(format!(
                "class '{}' has no constructor but was called with arguments",
                class
            ));
        }

        self.emit_move(dst, object);
        self.registers.free(object)?;
        Ok(())
    }

    // ========================
    // Small helpers
    // ========================

    pub(crate) fn is_boxed(&self, name: &str) -> bool {
        self.boxed_bindings.get(name).copied().unwrap_or(false)
    }

    fn this_register(&self) -> Result<u8, String> {
        if self.in_lambda {
            return Err("'this' is not available inside a lambda body".to_string());
        }
        self.registers
            .receiver()
            .ok_or_else(|| "'this' used outside of an instance method".to_string())
    }

    pub(crate) fn global_slot(&self, name: &str) -> Result<u16, String> {
        self.globals
            .get(name)
            .copied()
            .ok_or_else(|| format!("reference to undeclared global '{}'", name))
    }

    pub(crate) fn key_is_integer(&self, ty: &Type) -> bool {
        let reprs = &self.enum_reprs;
        types::is_integer_keyed(ty, |name| reprs.get(name).copied())
    }

    pub(crate) fn free_if_owned(&mut self, reg: u8, owned: bool) -> Result<(), String> {
        if owned {
            self.registers.free(reg)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ast::Binding;

    fn binding(name: &str, ty: Type) -> Binding {
        Binding {
            name: name.to_string(),
            ty,
            boxed: false,
        }
    }

    fn empty_main() -> Function {
        Function {
            name: "main".to_string(),
            params: vec![],
            locals: vec![],
            return_ty: Type::Void,
            body: vec![],
            has_receiver: false,
        }
    }

    fn program_with_main(main: Function) -> Program {
        Program {
            source_file: "test.doof".to_string(),
            main,
            globals: vec![],
            functions: vec![],
            classes: vec![],
            extern_classes: vec![],
            enums: vec![],
        }
    }

    #[test]
    fn test_constant_dedup() {
        let mut codegen = Codegen::new("test.doof");
        let a = codegen.add_constant(Constant::Str("hello".to_string())).unwrap();
        let b = codegen.add_constant(Constant::Int(7)).unwrap();
        let c = codegen.add_constant(Constant::Str("hello".to_string())).unwrap();
        let d = codegen.add_constant(Constant::Int(8)).unwrap();
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_ne!(b, d);
    }

    #[test]
    fn test_entry_starts_at_zero_and_halts() {
        let unit = Codegen::new("test.doof")
            .compile(&program_with_main(empty_main()))
            .unwrap();
        assert_eq!(unit.functions[0].address, 0);
        assert_eq!(unit.instructions.last().unwrap().op, Op::Halt);
    }

    #[test]
    fn test_jump_resolution_bases() {
        // A forward Jump and a forward BranchFalse to the same label must
        // resolve to offsets differing by exactly one.
        let mut codegen = Codegen::new("test.doof");
        let label = codegen.create_label();
        codegen.emit(Op::LoadTrue, 1, 0, 0);
        let jump = codegen.emit_jump(Op::Jump, 0, &label);
        let branch = codegen.emit_jump(Op::BranchFalse, 1, &label);
        codegen.emit(Op::LoadNull, 0, 0, 0);
        codegen.bind_label(&label);
        codegen.emit(Op::Return, 0, 0, 0);
        codegen.resolve_pending_jumps().unwrap();

        // Target index is 4; Jump at 1 uses target - (source + 1) = 2,
        // BranchFalse at 2 uses target - source = 2.
        assert_eq!(codegen.instructions[jump].bc_signed(), 2);
        assert_eq!(codegen.instructions[branch].bc_signed(), 2);
    }

    #[test]
    fn test_backward_jump_is_negative() {
        let mut codegen = Codegen::new("test.doof");
        let label = codegen.create_label();
        codegen.bind_label(&label);
        codegen.emit(Op::LoadNull, 0, 0, 0);
        let jump = codegen.emit_jump(Op::Jump, 0, &label);
        codegen.resolve_pending_jumps().unwrap();
        // Jump at index 1 back to 0: 0 - (1 + 1) = -2.
        assert_eq!(codegen.instructions[jump].bc_signed(), -2);
    }

    #[test]
    fn test_unresolved_label_is_fatal() {
        let mut codegen = Codegen::new("test.doof");
        codegen.emit_jump(Op::Jump, 0, "L999");
        assert!(codegen.resolve_pending_jumps().is_err());
    }

    #[test]
    fn test_continue_inside_switch_rejected() {
        let main = Function {
            body: vec![Stmt::new(StmtKind::Switch {
                discriminant: Expr::IntLit(1),
                ty: Type::Int,
                cases: vec![crate::compiler::ast::SwitchCase {
                    test: CaseTest::Exact {
                        value: Expr::IntLit(1),
                        ty: Type::Int,
                    },
                    body: vec![Stmt::new(StmtKind::Continue)],
                }],
                default: None,
            })],
            locals: vec![],
            ..empty_main()
        };
        let err = Codegen::new("test.doof")
            .compile(&program_with_main(main))
            .unwrap_err();
        assert!(err.contains("continue"), "unexpected error: {}", err);
    }

    #[test]
    fn test_break_inside_switch_allowed() {
        let main = Function {
            body: vec![Stmt::new(StmtKind::Switch {
                discriminant: Expr::IntLit(1),
                ty: Type::Int,
                cases: vec![crate::compiler::ast::SwitchCase {
                    test: CaseTest::Exact {
                        value: Expr::IntLit(1),
                        ty: Type::Int,
                    },
                    body: vec![Stmt::new(StmtKind::Break)],
                }],
                default: None,
            })],
            ..empty_main()
        };
        assert!(
            Codegen::new("test.doof")
                .compile(&program_with_main(main))
                .is_ok()
        );
    }

    #[test]
    fn test_null_discriminant_rejected() {
        let main = Function {
            body: vec![Stmt::new(StmtKind::Switch {
                discriminant: Expr::NullLit,
                ty: Type::Null,
                cases: vec![],
                default: None,
            })],
            ..empty_main()
        };
        let err = Codegen::new("test.doof")
            .compile(&program_with_main(main))
            .unwrap_err();
        assert!(err.contains("cannot compare"), "unexpected error: {}", err);
    }

    #[test]
    fn test_undeclared_local_is_fatal() {
        let main = Function {
            body: vec![Stmt::new(StmtKind::Expr {
                expr: Expr::Local {
                    name: "ghost".to_string(),
                },
            })],
            ..empty_main()
        };
        let err = Codegen::new("test.doof")
            .compile(&program_with_main(main))
            .unwrap_err();
        assert!(err.contains("undeclared"), "unexpected error: {}", err);
    }

    #[test]
    fn test_boxed_let_wraps_in_cell() {
        let main = Function {
            locals: vec![Binding {
                name: "counter".to_string(),
                ty: Type::Int,
                boxed: true,
            }],
            body: vec![Stmt::new(StmtKind::Let {
                name: "counter".to_string(),
                init: Expr::IntLit(0),
            })],
            ..empty_main()
        };
        let unit = Codegen::new("test.doof")
            .compile(&program_with_main(main))
            .unwrap();
        assert!(
            unit.instructions.iter().any(|i| i.op == Op::NewCell),
            "boxed local must be wrapped in a capture cell"
        );
    }

    #[test]
    fn test_void_function_gets_implicit_return() {
        let func = Function {
            name: "noop".to_string(),
            return_ty: Type::Void,
            ..empty_main()
        };
        let mut program = program_with_main(empty_main());
        program.functions.push(func);
        let unit = Codegen::new("test.doof").compile(&program).unwrap();
        let record = &unit.functions[1];
        let body = &unit.instructions[record.address..record.end_address];
        assert_eq!(body[body.len() - 2].op, Op::LoadNull);
        assert_eq!(body[body.len() - 1].op, Op::Return);
    }

    #[test]
    fn test_consecutive_empty_bodies_each_return() {
        // The previous function's Return must not satisfy the next
        // function's implicit-return check.
        let mut program = program_with_main(empty_main());
        for name in ["a", "b"] {
            program.functions.push(Function {
                name: name.to_string(),
                return_ty: Type::Void,
                ..empty_main()
            });
        }
        let unit = Codegen::new("test.doof").compile(&program).unwrap();
        for record in &unit.functions[1..] {
            let body = &unit.instructions[record.address..record.end_address];
            assert_eq!(body.len(), 2, "empty body of {} must still return", record.name);
            assert_eq!(body[0].op, Op::LoadNull);
            assert_eq!(body[1].op, Op::Return);
        }
    }

    #[test]
    fn test_debug_rows_follow_statement_locations() {
        let main = Function {
            locals: vec![binding("x", Type::Int)],
            body: vec![Stmt::with_loc(
                StmtKind::Let {
                    name: "x".to_string(),
                    init: Expr::IntLit(3),
                },
                7,
                5,
            )],
            ..empty_main()
        };
        let unit = Codegen::new("test.doof")
            .compile(&program_with_main(main))
            .unwrap();
        assert!(!unit.debug.source_map.is_empty());
        assert_eq!(unit.debug.source_map[0].line, 7);
        assert_eq!(unit.debug.source_map[0].column, 5);
    }

    #[test]
    fn test_without_debug_emits_no_rows() {
        let main = Function {
            locals: vec![binding("x", Type::Int)],
            body: vec![Stmt::with_loc(
                StmtKind::Let {
                    name: "x".to_string(),
                    init: Expr::IntLit(3),
                },
                7,
                5,
            )],
            ..empty_main()
        };
        let unit = Codegen::without_debug("test.doof")
            .compile(&program_with_main(main))
            .unwrap();
        assert!(unit.debug.source_map.is_empty());
        assert!(unit.debug.functions.is_empty());
    }
}
