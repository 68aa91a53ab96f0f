//! Call-site lowering.
//!
//! Every call site arrives with an externally resolved dispatch category;
//! this module's only job is to stage the contiguous argument block
//! (receiver first for instance calls) and emit the matching call opcode.
//! Results land in the block's base register and are moved to the
//! requested destination.

use crate::bytecode::{Constant, Op};
use crate::compiler::ast::{Argument, CallDispatch, CallExpr, Expr};
use crate::compiler::codegen::Codegen;
use crate::compiler::types::Type;

/// Fixed intrinsic table: name -> (id, arity).
fn intrinsic(name: &str) -> Option<(u8, usize)> {
    match name {
        "print" => Some((0, 1)),
        "clock" => Some((1, 0)),
        "readLine" => Some((2, 0)),
        _ => None,
    }
}

fn require_receiver<'a>(
    call: &'a CallExpr,
    class: &str,
    method: &str,
) -> Result<&'a Expr, String> {
    call.receiver
        .as_deref()
        .ok_or_else(|| format!("instance call to '{}.{}' without a receiver", class, method))
}

impl Codegen {
    pub(crate) fn compile_call_into(&mut self, call: &CallExpr, dst: u8) -> Result<(), String> {
        match &call.dispatch {
            CallDispatch::Intrinsic { name } => self.compile_intrinsic(name, &call.args, dst),
            CallDispatch::Function { name } => {
                let index = self.function_index(name)?;
                let constant = self.add_constant(Constant::Function(index))?;
                self.compile_plain_call(constant, &call.args, dst)
            }
            CallDispatch::Static { class, method } => {
                let index = self.function_index(&format!("{}.{}", class, method))?;
                let constant = self.add_constant(Constant::Function(index))?;
                self.compile_plain_call(constant, &call.args, dst)
            }
            CallDispatch::Method { class, method } => {
                let receiver = require_receiver(call, class, method)?;
                let index = self.function_index(&format!("{}.{}", class, method))?;
                let constant = self.add_constant(Constant::Function(index))?;
                self.compile_receiver_call(Op::CallMethod, constant, receiver, &call.args, dst)
            }
            CallDispatch::Native { class, method } => {
                let receiver = require_receiver(call, class, method)?;
                let key = format!("{}.{}", class, method);
                let arity = self
                    .extern_method_arity(&key)
                    .ok_or_else(|| format!("missing extern method metadata for '{}'", key))?;
                if call.args.len() != arity {
                    return Err(format!(
                        "extern method '{}' takes {} argument(s), got {}",
                        key,
                        arity,
                        call.args.len()
                    ));
                }
                let constant = self.add_constant(Constant::Str(key))?;
                self.compile_receiver_call(Op::CallNative, constant, receiver, &call.args, dst)
            }
            CallDispatch::Collection { container, method } => {
                self.compile_collection_call(container, method, call, dst)
            }
            CallDispatch::Union { method } => {
                let receiver = call.receiver.as_deref().ok_or_else(|| {
                    format!("union method call to '{}' without a receiver", method)
                })?;
                let constant = self.add_constant(Constant::Str(method.clone()))?;
                self.compile_receiver_call(Op::CallDynamic, constant, receiver, &call.args, dst)
            }
        }
    }

    fn compile_intrinsic(
        &mut self,
        name: &str,
        args: &[Argument],
        dst: u8,
    ) -> Result<(), String> {
        let (id, arity) =
            intrinsic(name).ok_or_else(|| format!("unknown intrinsic '{}'", name))?;
        if args.len() != arity {
            return Err(format!(
                "intrinsic '{}' takes exactly {} argument(s), got {}",
                name,
                arity,
                args.len()
            ));
        }
        let block_len = args.len().max(1);
        let base = self.registers.allocate_contiguous(block_len)?;
        self.stage_arguments(base, 0, args)?;
        self.emit(Op::CallIntrinsic, base, args.len() as u8, id);
        self.emit_move(dst, base);
        self.registers.free_contiguous(base, block_len)?;
        Ok(())
    }

    fn compile_plain_call(
        &mut self,
        constant: u16,
        args: &[Argument],
        dst: u8,
    ) -> Result<(), String> {
        let block_len = args.len().max(1);
        let base = self.registers.allocate_contiguous(block_len)?;
        self.stage_arguments(base, 0, args)?;
        self.emit_bc(Op::Call, base, constant);
        self.emit_move(dst, base);
        self.registers.free_contiguous(base, block_len)?;
        Ok(())
    }

    fn compile_receiver_call(
        &mut self,
        op: Op,
        constant: u16,
        receiver: &Expr,
        args: &[Argument],
        dst: u8,
    ) -> Result<(), String> {
        let block_len = args.len() + 1;
        let base = self.registers.allocate_contiguous(block_len)?;
        self.compile_expr_into(receiver, base)?;
        self.stage_arguments(base, 1, args)?;
        self.emit_bc(op, base, constant);
        self.emit_move(dst, base);
        self.registers.free_contiguous(base, block_len)?;
        Ok(())
    }

    /// Stage call arguments into their positional slots. Evaluation always
    /// follows source order: when named arguments are reordered and any
    /// expression may have a side effect, everything is evaluated into
    /// temporaries first and moved into place afterwards; otherwise each
    /// argument is generated directly into its positional register.
    fn stage_arguments(&mut self, base: u8, offset: usize, args: &[Argument]) -> Result<(), String> {
        for arg in args {
            if arg.position >= args.len() {
                return Err(format!(
                    "argument position {} out of range for a call with {} arguments",
                    arg.position,
                    args.len()
                ));
            }
        }
        let reordered = args.iter().enumerate().any(|(i, arg)| arg.position != i);
        let effectful = args.iter().any(|arg| arg.expr.may_have_side_effects());

        if reordered && effectful {
            let mut staged = Vec::with_capacity(args.len());
            for arg in args {
                let tmp = self.registers.allocate_temporary()?;
                self.compile_expr_into(&arg.expr, tmp)?;
                staged.push((tmp, arg.position));
            }
            for (tmp, position) in staged {
                self.emit_move((base as usize + offset + position) as u8, tmp);
                self.registers.free(tmp)?;
            }
        } else {
            for arg in args {
                let slot = (base as usize + offset + arg.position) as u8;
                self.compile_expr_into(&arg.expr, slot)?;
            }
        }
        Ok(())
    }

    // ========================
    // Collection methods
    // ========================

    fn compile_collection_call(
        &mut self,
        container: &Type,
        method: &str,
        call: &CallExpr,
        dst: u8,
    ) -> Result<(), String> {
        let receiver = call
            .receiver
            .as_deref()
            .ok_or_else(|| format!("collection method call to '{}' without a receiver", method))?;
        match container {
            Type::Array(_) => self.compile_array_method(method, receiver, &call.args, dst),
            Type::Map(key, _) => {
                let int_keyed = self.key_is_integer(key);
                self.compile_map_method(method, int_keyed, receiver, &call.args, dst)
            }
            Type::Set(elem) => {
                let int_keyed = self.key_is_integer(elem);
                self.compile_set_method(method, int_keyed, receiver, &call.args, dst)
            }
            Type::String => match method {
                "length" => {
                    self.expect_args(method, &call.args, 0)?;
                    let (recv, owned) = self.compile_expr_operand(receiver)?;
                    self.emit(Op::StringLength, dst, recv, 0);
                    self.free_if_owned(recv, owned)
                }
                other => Err(format!("unknown string method '{}'", other)),
            },
            other => Err(format!(
                "collection dispatch on non-collection type '{}'",
                other
            )),
        }
    }

    fn expect_args(&self, method: &str, args: &[Argument], arity: usize) -> Result<(), String> {
        if args.len() != arity {
            return Err(format!(
                "method '{}' takes exactly {} argument(s), got {}",
                method,
                arity,
                args.len()
            ));
        }
        Ok(())
    }

    fn compile_array_method(
        &mut self,
        method: &str,
        receiver: &Expr,
        args: &[Argument],
        dst: u8,
    ) -> Result<(), String> {
        match method {
            "push" => {
                self.expect_args(method, args, 1)?;
                let (recv, recv_owned) = self.compile_expr_operand(receiver)?;
                let (value, value_owned) = self.compile_expr_operand(&args[0].expr)?;
                self.emit(Op::ArrayPush, recv, value, 0);
                self.emit(Op::LoadNull, dst, 0, 0);
                self.free_if_owned(value, value_owned)?;
                self.free_if_owned(recv, recv_owned)
            }
            "length" => {
                self.expect_args(method, args, 0)?;
                let (recv, owned) = self.compile_expr_operand(receiver)?;
                self.emit(Op::ArrayLength, dst, recv, 0);
                self.free_if_owned(recv, owned)
            }
            "filter" | "map" | "forEach" | "reduce" => {
                if method == "reduce" {
                    if args.len() != 2 {
                        return Err(
                            "reduce requires exactly two arguments: a seed and a reducer"
                                .to_string(),
                        );
                    }
                } else {
                    self.expect_args(method, args, 1)?;
                }
                // The helper is generated once and invoked like any other
                // function, with the array as its first argument.
                let helper = self.declare_array_helper(method)?;
                let constant = self.add_constant(Constant::Function(helper))?;
                let block_len = args.len() + 1;
                let base = self.registers.allocate_contiguous(block_len)?;
                self.compile_expr_into(receiver, base)?;
                self.stage_arguments(base, 1, args)?;
                self.emit_bc(Op::Call, base, constant);
                self.emit_move(dst, base);
                self.registers.free_contiguous(base, block_len)
            }
            other => Err(format!("unknown array method '{}'", other)),
        }
    }

    fn compile_map_method(
        &mut self,
        method: &str,
        int_keyed: bool,
        receiver: &Expr,
        args: &[Argument],
        dst: u8,
    ) -> Result<(), String> {
        let pick = |generic: Op, int: Op| if int_keyed { int } else { generic };
        match method {
            "get" => {
                self.expect_args(method, args, 1)?;
                let (recv, recv_owned) = self.compile_expr_operand(receiver)?;
                let (key, key_owned) = self.compile_expr_operand(&args[0].expr)?;
                self.emit(pick(Op::MapGet, Op::MapGetInt), dst, recv, key);
                self.free_if_owned(key, key_owned)?;
                self.free_if_owned(recv, recv_owned)
            }
            "set" => {
                self.expect_args(method, args, 2)?;
                let (recv, recv_owned) = self.compile_expr_operand(receiver)?;
                let (key, key_owned) = self.compile_expr_operand(&args[0].expr)?;
                let (value, value_owned) = self.compile_expr_operand(&args[1].expr)?;
                self.emit(pick(Op::MapSet, Op::MapSetInt), recv, key, value);
                self.emit(Op::LoadNull, dst, 0, 0);
                self.free_if_owned(value, value_owned)?;
                self.free_if_owned(key, key_owned)?;
                self.free_if_owned(recv, recv_owned)
            }
            "has" => {
                self.expect_args(method, args, 1)?;
                let (recv, recv_owned) = self.compile_expr_operand(receiver)?;
                let (key, key_owned) = self.compile_expr_operand(&args[0].expr)?;
                self.emit(pick(Op::MapHas, Op::MapHasInt), dst, recv, key);
                self.free_if_owned(key, key_owned)?;
                self.free_if_owned(recv, recv_owned)
            }
            "delete" => {
                self.expect_args(method, args, 1)?;
                let (recv, recv_owned) = self.compile_expr_operand(receiver)?;
                let (key, key_owned) = self.compile_expr_operand(&args[0].expr)?;
                self.emit(pick(Op::MapDelete, Op::MapDeleteInt), dst, recv, key);
                self.free_if_owned(key, key_owned)?;
                self.free_if_owned(recv, recv_owned)
            }
            "size" => {
                self.expect_args(method, args, 0)?;
                let (recv, owned) = self.compile_expr_operand(receiver)?;
                self.emit(Op::MapSize, dst, recv, 0);
                self.free_if_owned(recv, owned)
            }
            "clear" => {
                self.expect_args(method, args, 0)?;
                let (recv, owned) = self.compile_expr_operand(receiver)?;
                self.emit(Op::MapClear, recv, 0, 0);
                self.emit(Op::LoadNull, dst, 0, 0);
                self.free_if_owned(recv, owned)
            }
            // Unrecognized map methods degrade to null instead of failing.
            // Kept as-is for wire compatibility; see DESIGN.md.
            _ => {
                self.emit(Op::LoadNull, dst, 0, 0);
                Ok(())
            }
        }
    }

    fn compile_set_method(
        &mut self,
        method: &str,
        int_elem: bool,
        receiver: &Expr,
        args: &[Argument],
        dst: u8,
    ) -> Result<(), String> {
        let pick = |generic: Op, int: Op| if int_elem { int } else { generic };
        match method {
            "add" => {
                self.expect_args(method, args, 1)?;
                let (recv, recv_owned) = self.compile_expr_operand(receiver)?;
                let (elem, elem_owned) = self.compile_expr_operand(&args[0].expr)?;
                self.emit(pick(Op::SetAdd, Op::SetAddInt), recv, elem, 0);
                self.emit(Op::LoadNull, dst, 0, 0);
                self.free_if_owned(elem, elem_owned)?;
                self.free_if_owned(recv, recv_owned)
            }
            "has" => {
                self.expect_args(method, args, 1)?;
                let (recv, recv_owned) = self.compile_expr_operand(receiver)?;
                let (elem, elem_owned) = self.compile_expr_operand(&args[0].expr)?;
                self.emit(pick(Op::SetHas, Op::SetHasInt), dst, recv, elem);
                self.free_if_owned(elem, elem_owned)?;
                self.free_if_owned(recv, recv_owned)
            }
            "delete" => {
                self.expect_args(method, args, 1)?;
                let (recv, recv_owned) = self.compile_expr_operand(receiver)?;
                let (elem, elem_owned) = self.compile_expr_operand(&args[0].expr)?;
                self.emit(pick(Op::SetDelete, Op::SetDeleteInt), dst, recv, elem);
                self.free_if_owned(elem, elem_owned)?;
                self.free_if_owned(recv, recv_owned)
            }
            "size" => {
                self.expect_args(method, args, 0)?;
                let (recv, owned) = self.compile_expr_operand(receiver)?;
                self.emit(Op::SetSize, dst, recv, 0);
                self.free_if_owned(recv, owned)
            }
            "clear" => {
                self.expect_args(method, args, 0)?;
                let (recv, owned) = self.compile_expr_operand(receiver)?;
                self.emit(Op::SetClear, recv, 0, 0);
                self.emit(Op::LoadNull, dst, 0, 0);
                self.free_if_owned(recv, owned)
            }
            // Same permissive fallback as maps, with a false result.
            _ => {
                self.emit(Op::LoadFalse, dst, 0, 0);
                Ok(())
            }
        }
    }

    // ========================
    // Synthesized array helpers
    // ========================

    /// Compile the body of a `@array_*` helper. Each helper is an ordinary
    /// function that loops with the iterator protocol and invokes the
    /// user's lambda per element.
    pub(crate) fn compile_array_helper_body(
        &mut self,
        index: usize,
        method: &str,
    ) -> Result<(), String> {
        match method {
            "filter" => self.compile_filter_helper(index),
            "map" => self.compile_map_helper(index),
            "forEach" => self.compile_foreach_helper(index),
            "reduce" => self.compile_reduce_helper(index),
            other => Err(format!("unknown array helper '{}'", other)),
        }
    }

    fn compile_filter_helper(&mut self, index: usize) -> Result<(), String> {
        let (start, debug_index) =
            self.begin_synthetic_frame(index, &["arr", "fn"], &["result"])?;
        let arr = self.registers.variable("arr")?;
        let lambda = self.registers.variable("fn")?;
        let result = self.registers.variable("result")?;
        self.emit_bc(Op::NewArray, result, 0);

        let elem = self.registers.allocate_temporary()?;
        self.compile_iterator_loop(arr, elem, false, &mut |this| {
            let base = this.registers.allocate_contiguous(1)?;
            this.emit_move(base, elem);
            this.emit(Op::CallLambda, lambda, base, 1);
            let skip = this.create_label();
            this.emit_jump(Op::BranchFalse, base, &skip);
            this.emit(Op::ArrayPush, result, elem, 0);
            this.bind_label(&skip);
            this.registers.free_contiguous(base, 1)
        })?;
        self.registers.free(elem)?;

        self.emit_move(0, result);
        self.emit(Op::Return, 0, 0, 0);
        self.finish_synthetic_frame(index, start, debug_index);
        Ok(())
    }

    fn compile_map_helper(&mut self, index: usize) -> Result<(), String> {
        let (start, debug_index) =
            self.begin_synthetic_frame(index, &["arr", "fn"], &["result"])?;
        let arr = self.registers.variable("arr")?;
        let lambda = self.registers.variable("fn")?;
        let result = self.registers.variable("result")?;
        self.emit_bc(Op::NewArray, result, 0);

        let elem = self.registers.allocate_temporary()?;
        self.compile_iterator_loop(arr, elem, false, &mut |this| {
            let base = this.registers.allocate_contiguous(1)?;
            this.emit_move(base, elem);
            this.emit(Op::CallLambda, lambda, base, 1);
            this.emit(Op::ArrayPush, result, base, 0);
            this.registers.free_contiguous(base, 1)
        })?;
        self.registers.free(elem)?;

        self.emit_move(0, result);
        self.emit(Op::Return, 0, 0, 0);
        self.finish_synthetic_frame(index, start, debug_index);
        Ok(())
    }

    fn compile_foreach_helper(&mut self, index: usize) -> Result<(), String> {
        let (start, debug_index) = self.begin_synthetic_frame(index, &["arr", "fn"], &[])?;
        let arr = self.registers.variable("arr")?;
        let lambda = self.registers.variable("fn")?;

        let elem = self.registers.allocate_temporary()?;
        self.compile_iterator_loop(arr, elem, false, &mut |this| {
            let base = this.registers.allocate_contiguous(1)?;
            this.emit_move(base, elem);
            this.emit(Op::CallLambda, lambda, base, 1);
            this.registers.free_contiguous(base, 1)
        })?;
        self.registers.free(elem)?;

        self.emit(Op::LoadNull, 0, 0, 0);
        self.emit(Op::Return, 0, 0, 0);
        self.finish_synthetic_frame(index, start, debug_index);
        Ok(())
    }

    fn compile_reduce_helper(&mut self, index: usize) -> Result<(), String> {
        let (start, debug_index) =
            self.begin_synthetic_frame(index, &["arr", "seed", "fn"], &[])?;
        let arr = self.registers.variable("arr")?;
        let acc = self.registers.variable("seed")?;
        let lambda = self.registers.variable("fn")?;

        let elem = self.registers.allocate_temporary()?;
        self.compile_iterator_loop(arr, elem, false, &mut |this| {
            let base = this.registers.allocate_contiguous(2)?;
            this.emit_move(base, acc);
            this.emit_move((base as usize + 1) as u8, elem);
            this.emit(Op::CallLambda, lambda, base, 2);
            this.emit_move(acc, base);
            this.registers.free_contiguous(base, 2)
        })?;
        self.registers.free(elem)?;

        self.emit_move(0, acc);
        self.emit(Op::Return, 0, 0, 0);
        self.finish_synthetic_frame(index, start, debug_index);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ast::{
        Binding, CallDispatch, Function, Program, Stmt, StmtKind,
    };
    use crate::compiler::codegen::Codegen;
    use crate::compiler::types::Type;

    fn int_binding(name: &str) -> Binding {
        Binding {
            name: name.to_string(),
            ty: Type::Int,
            boxed: false,
        }
    }

    fn void_function(name: &str, params: Vec<Binding>, body: Vec<Stmt>) -> Function {
        Function {
            name: name.to_string(),
            params,
            locals: vec![],
            return_ty: Type::Void,
            body,
            has_receiver: false,
        }
    }

    fn call(dispatch: CallDispatch, args: Vec<Argument>) -> Expr {
        Expr::Call(CallExpr {
            dispatch,
            receiver: None,
            args,
        })
    }

    fn program(main_body: Vec<Stmt>, functions: Vec<Function>) -> Program {
        Program {
            source_file: "test.doof".to_string(),
            main: void_function("main", vec![], main_body),
            globals: vec![],
            functions,
            classes: vec![],
            extern_classes: vec![],
            enums: vec![],
        }
    }

    #[test]
    fn test_user_call_stages_contiguous_block() {
        let callee = void_function("f", vec![int_binding("a"), int_binding("b")], vec![]);
        let body = vec![Stmt::new(StmtKind::Expr {
            expr: call(
                CallDispatch::Function {
                    name: "f".to_string(),
                },
                vec![
                    Argument::positional(0, Expr::IntLit(1)),
                    Argument::positional(1, Expr::IntLit(2)),
                ],
            ),
        })];
        let unit = Codegen::new("test.doof")
            .compile(&program(body, vec![callee]))
            .unwrap();
        let call_inst = unit
            .instructions
            .iter()
            .find(|i| i.op == Op::Call)
            .expect("no call emitted");
        // Arguments staged at adjacent registers starting at the block base.
        let base = call_inst.a;
        let loads: Vec<_> = unit
            .instructions
            .iter()
            .filter(|i| i.op == Op::LoadInt)
            .collect();
        assert_eq!(loads[0].a, base);
        assert_eq!(loads[1].a, base + 1);
    }

    #[test]
    fn test_missing_function_metadata_is_fatal() {
        let body = vec![Stmt::new(StmtKind::Expr {
            expr: call(
                CallDispatch::Function {
                    name: "missing".to_string(),
                },
                vec![],
            ),
        })];
        let err = Codegen::new("test.doof")
            .compile(&program(body, vec![]))
            .unwrap_err();
        assert!(err.contains("missing call-dispatch metadata"));
    }

    #[test]
    fn test_reduce_arity_enforced() {
        let body = vec![Stmt::new(StmtKind::Expr {
            expr: Expr::Call(CallExpr {
                dispatch: CallDispatch::Collection {
                    container: Type::Array(Box::new(Type::Int)),
                    method: "reduce".to_string(),
                },
                receiver: Some(Box::new(Expr::ArrayLit {
                    elem_ty: Type::Int,
                    elements: vec![],
                })),
                args: vec![Argument::positional(0, Expr::IntLit(0))],
            }),
        })];
        let err = Codegen::new("test.doof")
            .compile(&program(body, vec![]))
            .unwrap_err();
        assert!(err.contains("reduce requires exactly two arguments"));
    }

    #[test]
    fn test_unknown_map_method_degrades_to_null() {
        let body = vec![Stmt::new(StmtKind::Expr {
            expr: Expr::Call(CallExpr {
                dispatch: CallDispatch::Collection {
                    container: Type::Map(Box::new(Type::String), Box::new(Type::Int)),
                    method: "frobnicate".to_string(),
                },
                receiver: Some(Box::new(Expr::NewCollection {
                    ty: Type::Map(Box::new(Type::String), Box::new(Type::Int)),
                })),
                args: vec![],
            }),
        })];
        let unit = Codegen::new("test.doof")
            .compile(&program(body, vec![]))
            .unwrap();
        assert!(unit.instructions.iter().any(|i| i.op == Op::LoadNull));
    }

    #[test]
    fn test_unknown_set_method_degrades_to_false() {
        let body = vec![Stmt::new(StmtKind::Expr {
            expr: Expr::Call(CallExpr {
                dispatch: CallDispatch::Collection {
                    container: Type::Set(Box::new(Type::String)),
                    method: "frobnicate".to_string(),
                },
                receiver: Some(Box::new(Expr::NewCollection {
                    ty: Type::Set(Box::new(Type::String)),
                })),
                args: vec![],
            }),
        })];
        let unit = Codegen::new("test.doof")
            .compile(&program(body, vec![]))
            .unwrap();
        assert!(unit.instructions.iter().any(|i| i.op == Op::LoadFalse));
    }

    #[test]
    fn test_integer_keyed_map_selects_int_opcode() {
        let map_ty = Type::Map(Box::new(Type::Int), Box::new(Type::String));
        let body = vec![Stmt::new(StmtKind::Expr {
            expr: Expr::Call(CallExpr {
                dispatch: CallDispatch::Collection {
                    container: map_ty.clone(),
                    method: "get".to_string(),
                },
                receiver: Some(Box::new(Expr::NewCollection { ty: map_ty })),
                args: vec![Argument::positional(0, Expr::IntLit(7))],
            }),
        })];
        let unit = Codegen::new("test.doof")
            .compile(&program(body, vec![]))
            .unwrap();
        assert!(unit.instructions.iter().any(|i| i.op == Op::MapGetInt));
        assert!(!unit.instructions.iter().any(|i| i.op == Op::MapGet));
    }

    #[test]
    fn test_array_helper_generated_once() {
        let lambda = || {
            Expr::Lambda(crate::compiler::ast::LambdaExpr {
                function: Function {
                    name: String::new(),
                    params: vec![int_binding("x")],
                    locals: vec![],
                    return_ty: Type::Bool,
                    body: vec![Stmt::new(StmtKind::Return {
                        value: Some(Expr::BoolLit(true)),
                    })],
                    has_receiver: true,
                },
                captures: vec![],
            })
        };
        let filter_call = |arr: Expr| {
            Stmt::new(StmtKind::Expr {
                expr: Expr::Call(CallExpr {
                    dispatch: CallDispatch::Collection {
                        container: Type::Array(Box::new(Type::Int)),
                        method: "filter".to_string(),
                    },
                    receiver: Some(Box::new(arr)),
                    args: vec![Argument::positional(0, lambda())],
                }),
            })
        };
        let arr = || Expr::ArrayLit {
            elem_ty: Type::Int,
            elements: vec![Expr::IntLit(1)],
        };
        let body = vec![filter_call(arr()), filter_call(arr())];
        let unit = Codegen::new("test.doof")
            .compile(&program(body, vec![]))
            .unwrap();
        let helpers: Vec<_> = unit
            .functions
            .iter()
            .filter(|f| f.name == "@array_filter")
            .collect();
        assert_eq!(helpers.len(), 1, "filter helper must be generated once");
    }

    #[test]
    fn test_evaluation_order_preserved_for_named_args() {
        // f(b: g(), a: h()) — g() evaluates first but lands in slot 1.
        let g = void_function("g", vec![], vec![]);
        let h = void_function("h", vec![], vec![]);
        let f = void_function("f", vec![int_binding("a"), int_binding("b")], vec![]);
        let body = vec![Stmt::new(StmtKind::Expr {
            expr: Expr::Call(CallExpr {
                dispatch: CallDispatch::Function {
                    name: "f".to_string(),
                },
                receiver: None,
                args: vec![
                    Argument {
                        name: Some("b".to_string()),
                        position: 1,
                        expr: call(
                            CallDispatch::Function {
                                name: "g".to_string(),
                            },
                            vec![],
                        ),
                    },
                    Argument {
                        name: Some("a".to_string()),
                        position: 0,
                        expr: call(
                            CallDispatch::Function {
                                name: "h".to_string(),
                            },
                            vec![],
                        ),
                    },
                ],
            }),
        })];
        let unit = Codegen::new("test.doof")
            .compile(&program(body, vec![g, h, f]))
            .unwrap();

        // The inner calls must appear in source order (g before h), and
        // both must be followed by moves into the outer block.
        let call_targets: Vec<u16> = unit
            .instructions
            .iter()
            .filter(|i| i.op == Op::Call)
            .map(|i| i.bc())
            .collect();
        assert_eq!(call_targets.len(), 3);
        // Constants are added in evaluation order: g's descriptor first.
        let g_const = call_targets[0];
        let h_const = call_targets[1];
        assert_ne!(g_const, h_const);
        match (
            &unit.constants[g_const as usize],
            &unit.constants[h_const as usize],
        ) {
            (
                crate::bytecode::Constant::Function(g_idx),
                crate::bytecode::Constant::Function(h_idx),
            ) => {
                assert_eq!(unit.functions[*g_idx].name, "g");
                assert_eq!(unit.functions[*h_idx].name, "h");
            }
            other => panic!("unexpected constants: {:?}", other),
        }
    }
}
