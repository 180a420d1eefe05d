// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Runs whole scripts through the compiler and VM and asserts on captured
//! output, rather than going through the CLI binary (see `cli.rs` for
//! that).

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use thistle::vm::VM;

/// A `Write` sink the test can still read from after handing it to the VM
/// as a boxed trait object.
#[derive(Clone, Default)]
struct SharedBuf(Rc<RefCell<Vec<u8>>>);

impl io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn run_capturing(source: &str) -> String {
    let buf = SharedBuf::default();
    let mut vm = VM::with_output(false, false, Box::new(buf.clone()));
    let script = thistle::compiler::compile(source, &mut vm.heap).expect("script should compile");
    vm.run(script).expect("script should run without error");
    String::from_utf8(buf.0.borrow().clone()).expect("output is valid utf-8")
}

#[test]
fn arithmetic_precedence() {
    assert_eq!(run_capturing("print 1 + 2 * 3;"), "7\n");
}

#[test]
fn equal_string_literals_intern_to_the_same_object() {
    assert_eq!(
        run_capturing(r#"let a = "ab"; let b = "ab"; print a == b;"#),
        "true\n"
    );
}

#[test]
fn closures_share_a_captured_upvalue() {
    let source = r#"
        func mk() {
            let x = 0;
            func inc() {
                x = x + 1;
                return x;
            }
            return inc;
        }
        let f = mk();
        print f();
        print f();
        print f();
    "#;
    assert_eq!(run_capturing(source), "1\n2\n3\n");
}

#[test]
fn class_instantiation_and_method_call() {
    let source = r#"
        class Pair {
            Pair(a, b) {
                this.a = a;
                this.b = b;
            }
            sum() {
                return this.a + this.b;
            }
        }
        print Pair(2, 3).sum();
    "#;
    assert_eq!(run_capturing(source), "5\n");
}

#[test]
fn for_loop_accumulates() {
    let source = r#"
        let s = 0;
        for (let i = 1; i <= 5; i = i + 1) {
            s = s + i;
        }
        print s;
    "#;
    assert_eq!(run_capturing(source), "15\n");
}

#[test]
fn uninitialized_let_reads_as_null() {
    assert_eq!(run_capturing("let x; print x;"), "null\n");
}

#[test]
fn undefined_global_read_is_a_runtime_error() {
    let mut vm = VM::with_output(false, false, Box::new(Vec::<u8>::new()));
    let script = thistle::compiler::compile("y;", &mut vm.heap).expect("script should compile");
    let err = vm.run(script).expect_err("undefined variable must fault");
    assert!(matches!(
        err,
        thistle::InterpretError::Runtime {
            error: thistle::error::RuntimeError::UndefinedVariable { .. },
            ..
        }
    ));
}

#[test]
fn and_short_circuits() {
    let source = r#"
        func boom() {
            print "evaluated";
            return true;
        }
        print false and boom();
    "#;
    assert_eq!(run_capturing(source), "false\n");
}

#[test]
fn string_concatenation() {
    assert_eq!(run_capturing(r#"print "a" + "b" + "c";"#), "abc\n");
}

#[test]
fn str_builtin_round_trips_every_primitive_kind() {
    let source = r#"
        print str(true);
        print str(false);
        print str(null);
        print str(0);
        print str(1);
        print str(-1);
        print str(3.5);
    "#;
    assert_eq!(
        run_capturing(source),
        "true\nfalse\nnull\n0\n1\n-1\n3.5\n"
    );
}

#[test]
fn recursion_past_the_frame_cap_raises_stack_overflow_not_a_crash() {
    let source = r#"
        func recurse(n) {
            return recurse(n + 1);
        }
        recurse(0);
    "#;
    let mut vm = VM::with_output(false, false, Box::new(Vec::<u8>::new()));
    let script = thistle::compiler::compile(source, &mut vm.heap).expect("script should compile");
    let err = vm.run(script).expect_err("unbounded recursion must fault, not crash");
    assert!(matches!(
        err,
        thistle::InterpretError::Runtime {
            error: thistle::error::RuntimeError::StackOverflow,
            ..
        }
    ));
}
