// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright 2026 Tobias Sarnowski

//! Runs a representative program with and without `stress_gc` and asserts
//! identical output — collection timing must never be observable from
//! script behavior.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use thistle::vm::VM;

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

const PROGRAM: &str = r#"
    class Node {
        Node(value) {
            this.value = value;
            this.next = null;
        }
    }

    func push(head, value) {
        let node = Node(value);
        node.next = head;
        return node;
    }

    func sum(head) {
        let total = 0;
        while (head != null) {
            total = total + head.value;
            head = head.next;
        }
        return total;
    }

    func counter() {
        let n = 0;
        func bump() {
            n = n + 1;
            return n;
        }
        return bump;
    }

    let head = null;
    for (let i = 1; i <= 50; i = i + 1) {
        head = push(head, i);
    }
    print sum(head);

    let bump = counter();
    for (let i = 0; i < 10; i = i + 1) {
        print bump();
    }

    class Greeter {
        Greeter(name) {
            this.name = name;
        }
        greet() {
            return "hi " + this.name;
        }
    }
    print Greeter("thistle").greet();
"#;

fn run_capturing(stress_gc: bool) -> String {
    let buf = SharedBuf::default();
    let mut vm = VM::with_output(stress_gc, false, Box::new(buf.clone()));
    let script = thistle::compiler::compile(PROGRAM, &mut vm.heap).expect("program should compile");
    vm.run(script).expect("program should run without error");
    String::from_utf8(buf.0.borrow().clone()).expect("output is valid utf-8")
}

#[test]
fn stress_gc_does_not_change_program_output() {
    let normal = run_capturing(false);
    let stressed = run_capturing(true);
    assert_eq!(normal, stressed);
}
