//! Integration tests for classes, instances, and inheritance

use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

use lox::{Error, VM};

#[derive(Clone, Default)]
struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn run_capture(source: &str) -> (Result<(), Error>, String) {
    let buffer = SharedBuffer::default();
    let mut vm = VM::with_output(Box::new(buffer.clone()));
    let result = vm.interpret(source);
    let output = String::from_utf8(buffer.0.borrow().clone()).expect("output is UTF-8");
    (result, output)
}

fn run_ok(source: &str) -> String {
    let (result, output) = run_capture(source);
    result.expect("execution failed");
    output
}

#[test]
fn test_initializer_sets_fields() {
    let output = run_ok(
        r#"
        class P { init(x) { this.x = x; } }
        var p = P(42);
        println(p.x);
    "#,
    );
    assert_eq!(output, "42\n");
}

#[test]
fn test_init_result_is_the_instance() {
    let output = run_ok(
        r#"
        class P { init(x) { this.x = x; } }
        println(P(1));
    "#,
    );
    assert_eq!(output, "P instance\n");
}

#[test]
fn test_bare_return_in_init_returns_this() {
    let output = run_ok(
        r#"
        class P {
            init(x) {
                this.x = x;
                if (x > 10) { return; }
                this.x = 10;
            }
        }
        println(P(42).x);
        println(P(1).x);
    "#,
    );
    assert_eq!(output, "42\n10\n");
}

#[test]
fn test_methods_and_this() {
    let output = run_ok(
        r#"
        class Counter {
            init() { this.count = 0; }
            inc() {
                this.count = this.count + 1;
                return this.count;
            }
        }
        var c = Counter();
        c.inc();
        c.inc();
        println(c.inc());
    "#,
    );
    assert_eq!(output, "3\n");
}

#[test]
fn test_inheritance_and_super() {
    let output = run_ok(
        r#"
        class A { speak() { println("A"); } }
        class B < A {
            speak() {
                super.speak();
                println("B");
            }
        }
        B().speak();
    "#,
    );
    assert_eq!(output, "A\nB\n");
}

#[test]
fn test_inherited_method_binds_subclass_receiver() {
    let output = run_ok(
        r#"
        class A {
            who() { return this.name; }
        }
        class B < A {}
        var b = B();
        b.name = "b instance";
        println(b.who());
    "#,
    );
    assert_eq!(output, "b instance\n");
}

#[test]
fn test_super_through_bound_method() {
    let output = run_ok(
        r#"
        class A { greet() { return "from A"; } }
        class B < A {
            greet() { return "from B via " + super.greet(); }
        }
        var m = B().greet;
        println(m());
    "#,
    );
    assert_eq!(output, "from B via from A\n");
}

#[test]
fn test_fields_shadow_methods() {
    let output = run_ok(
        r#"
        class C {
            m() { return "method"; }
        }
        var c = C();
        println(c.m());
        fun shadow() { return "field"; }
        c.m = shadow;
        println(c.m());
    "#,
    );
    assert_eq!(output, "method\nfield\n");
}

#[test]
fn test_bound_method_keeps_receiver() {
    let output = run_ok(
        r#"
        class Box {
            init(v) { this.v = v; }
            get() { return this.v; }
        }
        var g = Box("kept").get;
        println(g());
    "#,
    );
    assert_eq!(output, "kept\n");
}

#[test]
fn test_class_and_instance_printing() {
    let output = run_ok(
        r#"
        class Point {}
        println(Point);
        println(Point());
    "#,
    );
    assert_eq!(output, "Point\nPoint instance\n");
}

#[test]
fn test_calling_class_without_init_rejects_args() {
    let (result, _) = run_capture("class Empty {} Empty(1);");
    assert_eq!(result, Err(Error::Runtime));
}

#[test]
fn test_init_arity_is_enforced() {
    let (result, _) = run_capture("class P { init(x) {} } P();");
    assert_eq!(result, Err(Error::Runtime));
}

#[test]
fn test_undefined_property_errors() {
    let (result, _) = run_capture("class C {} C().missing;");
    assert_eq!(result, Err(Error::Runtime));
}

#[test]
fn test_property_access_on_non_instance_errors() {
    let (result, _) = run_capture("var x = 1; x.field;");
    assert_eq!(result, Err(Error::Runtime));

    let (result, _) = run_capture("var x = 1; x.field = 2;");
    assert_eq!(result, Err(Error::Runtime));
}

#[test]
fn test_inheriting_from_non_class_errors() {
    let (result, _) = run_capture("var NotAClass = 1; class C < NotAClass {}");
    assert_eq!(result, Err(Error::Runtime));
}

#[test]
fn test_assignment_to_property_yields_value() {
    let output = run_ok(
        r#"
        class C {}
        var c = C();
        println(c.x = 5);
    "#,
    );
    assert_eq!(output, "5\n");
}

#[test]
fn test_invoked_field_closure() {
    let output = run_ok(
        r#"
        class Holder {}
        var h = Holder();
        fun hello() { return "hi"; }
        h.f = hello;
        println(h.f());
    "#,
    );
    assert_eq!(output, "hi\n");
}

#[test]
fn test_method_override_wins() {
    let output = run_ok(
        r#"
        class A {
            m() { return "A"; }
            n() { return "base n"; }
        }
        class B < A {
            m() { return "B"; }
        }
        var b = B();
        print(b.m());
        print(" ");
        print(b.n());
        println();
    "#,
    );
    assert_eq!(output, "B base n\n");
}
