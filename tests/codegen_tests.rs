//! Structural tests over the emitted instruction stream and document.

use doof::bytecode::{ConstantRow, Op};
use doof::compiler::ast::{
    Argument, Binding, CallDispatch, CallExpr, Expr, Function, GlobalDecl, LValue, Program, Stmt,
    StmtKind,
};
use doof::compiler::registers::RegisterAllocator;
use doof::compiler::types::Type;
use doof::config::BuildOptions;
use doof::{BytecodeDocument, Codegen};

fn int_binding(name: &str) -> Binding {
    Binding {
        name: name.to_string(),
        ty: Type::Int,
        boxed: false,
    }
}

fn void_function(name: &str, params: Vec<Binding>, locals: Vec<Binding>, body: Vec<Stmt>) -> Function {
    Function {
        name: name.to_string(),
        params,
        locals,
        return_ty: Type::Void,
        body,
        has_receiver: false,
    }
}

fn program(main_body: Vec<Stmt>) -> Program {
    Program {
        source_file: "test.doof".to_string(),
        main: void_function("main", vec![], vec![], main_body),
        globals: vec![],
        functions: vec![],
        classes: vec![],
        extern_classes: vec![],
        enums: vec![],
    }
}

#[test]
fn test_register_layout_formula() {
    // First temporary register is 1 + hasThis + P + L for every layout.
    for has_this in [false, true] {
        for params in 0..4usize {
            for locals in 0..4usize {
                let param_names: Vec<String> =
                    (0..params).map(|i| format!("p{}", i)).collect();
                let local_names: Vec<String> =
                    (0..locals).map(|i| format!("l{}", i)).collect();
                let mut regs = RegisterAllocator::new();
                regs.setup_function(&param_names, &local_names, has_this)
                    .unwrap();
                let expected = 1 + usize::from(has_this) + params + locals;
                assert_eq!(regs.first_temporary(), expected);
                assert_eq!(
                    regs.allocate_temporary().unwrap() as usize,
                    expected,
                    "first temporary must sit right above the frame layout"
                );
            }
        }
    }
}

#[test]
fn test_string_constants_deduplicated_across_functions() {
    let make_body = || {
        vec![Stmt::new(StmtKind::Expr {
            expr: Expr::StrLit("hello".to_string()),
        })]
    };
    let mut prog = program(make_body());
    prog.functions
        .push(void_function("f", vec![], vec![], make_body()));
    let unit = Codegen::new("test.doof").compile(&prog).unwrap();
    let hello_count = unit
        .constants
        .iter()
        .filter(|c| matches!(c, doof::bytecode::Constant::Str(s) if s == "hello"))
        .count();
    assert_eq!(hello_count, 1);
}

#[test]
fn test_while_loop_jump_targets_decode() {
    // let i = 0; while (i < 3) { i = i + 1; }
    let body = vec![
        Stmt::new(StmtKind::Let {
            name: "i".to_string(),
            init: Expr::IntLit(0),
        }),
        Stmt::new(StmtKind::While {
            cond: Expr::Binary {
                op: doof::compiler::ast::BinaryOp::Lt,
                lhs: Box::new(Expr::Local {
                    name: "i".to_string(),
                }),
                rhs: Box::new(Expr::IntLit(3)),
                lhs_ty: Type::Int,
                rhs_ty: Type::Int,
            },
            body: vec![Stmt::new(StmtKind::Assign {
                target: LValue::Local {
                    name: "i".to_string(),
                },
                value: Expr::Binary {
                    op: doof::compiler::ast::BinaryOp::Add,
                    lhs: Box::new(Expr::Local {
                        name: "i".to_string(),
                    }),
                    rhs: Box::new(Expr::IntLit(1)),
                    lhs_ty: Type::Int,
                    rhs_ty: Type::Int,
                },
            })],
        }),
    ];
    let mut prog = program(body);
    prog.main.locals = vec![int_binding("i")];
    let unit = Codegen::new("test.doof").compile(&prog).unwrap();

    // Every jump-bearing instruction must land inside the stream when its
    // offset is decoded with the documented base.
    for (index, inst) in unit.instructions.iter().enumerate() {
        if !inst.op.is_jump_bearing() {
            continue;
        }
        let base = if inst.op.is_branch() {
            index as i64
        } else {
            index as i64 + 1
        };
        let target = base + inst.bc_signed() as i64;
        assert!(
            target >= 0 && (target as usize) <= unit.instructions.len(),
            "decoded jump target {} out of range at {}",
            target,
            index
        );
    }

    // The loop's backward jump exists and is negative.
    assert!(
        unit.instructions
            .iter()
            .any(|i| i.op == Op::Jump && i.bc_signed() < 0),
        "while loop must emit a backward jump"
    );
}

#[test]
fn test_document_from_compiled_program() {
    let mut prog = program(vec![Stmt::new(StmtKind::Assign {
        target: LValue::Global {
            name: "answer".to_string(),
        },
        value: Expr::IntLit(42),
    })]);
    prog.globals.push(GlobalDecl {
        name: "answer".to_string(),
        ty: Type::Int,
    });

    let options = BuildOptions {
        generated_at: Some("0".to_string()),
        ..Default::default()
    };
    let document = doof::compiler::compile(&prog, &options).unwrap();
    assert_eq!(document.entry_point, 0);
    assert_eq!(document.global_count, 1);
    assert_eq!(document.functions[0].address, 0);
    assert!(document.debug.is_some());
    assert_eq!(document.metadata.generated_at, "0");

    let restored = BytecodeDocument::from_json(&document.to_json()).unwrap();
    assert_eq!(restored.instructions.len(), document.instructions.len());
}

#[test]
fn test_compile_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let ast_path = dir.path().join("unit.json");
    let prog = program(vec![Stmt::new(StmtKind::Expr {
        expr: Expr::Call(CallExpr {
            dispatch: CallDispatch::Intrinsic {
                name: "print".to_string(),
            },
            receiver: None,
            args: vec![Argument::positional(0, Expr::StrLit("hi".to_string()))],
        }),
    })]);
    std::fs::write(&ast_path, serde_json::to_string(&prog).unwrap()).unwrap();

    let options = BuildOptions {
        generated_at: Some("0".to_string()),
        ..Default::default()
    };
    let document = doof::compiler::compile_file(&ast_path, &options).unwrap();
    assert!(
        document
            .instructions
            .iter()
            .any(|i| i.mnemonic == "CALL_INTRINSIC")
    );
    assert!(
        document
            .constants
            .iter()
            .any(|c| matches!(c, ConstantRow::String(s) if s == "hi"))
    );
}

#[test]
fn test_build_options_loaded_from_manifest() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("doof.toml"), "[build]\ndebug = false\n").unwrap();
    let options = BuildOptions::load_or_default(dir.path());
    assert!(!options.emit_debug);
}

#[test]
fn test_no_debug_document_omits_section() {
    let prog = program(vec![]);
    let options = BuildOptions {
        emit_debug: false,
        generated_at: Some("0".to_string()),
        ..Default::default()
    };
    let document = doof::compiler::compile(&prog, &options).unwrap();
    assert!(document.debug.is_none());
}

#[test]
fn test_methods_receive_receiver_register() {
    use doof::compiler::ast::Class;
    let method = Function {
        name: "get".to_string(),
        params: vec![],
        locals: vec![],
        return_ty: Type::Int,
        body: vec![Stmt::new(StmtKind::Return {
            value: Some(Expr::Field {
                object: Box::new(Expr::This),
                class: "Box".to_string(),
                field: 0,
            }),
        })],
        has_receiver: true,
    };
    let mut prog = program(vec![]);
    prog.classes.push(Class {
        name: "Box".to_string(),
        fields: vec![int_binding("value")],
        constructor: None,
        methods: vec![method],
        static_methods: vec![],
    });
    let unit = Codegen::new("test.doof").compile(&prog).unwrap();
    let record = unit
        .functions
        .iter()
        .find(|f| f.name == "Box.get")
        .expect("method record missing");
    assert!(record.has_receiver);
    // this.value reads through GetField on register 1.
    let body = &unit.instructions[record.address..record.end_address];
    assert!(body.iter().any(|i| i.op == Op::GetField && i.b == 1));
}
