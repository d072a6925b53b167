//! The object heap and its garbage collector
//!
//! Every heap object lives in a slab indexed by [`Handle`]. Collection is
//! a stop-the-world tri-color mark-sweep: the VM marks its roots, the heap
//! drains the grey worklist, prunes dead interned strings, then sweeps
//! everything unmarked. Collections are only ever initiated between
//! instructions, so a multi-step allocation inside one instruction can
//! never lose an object halfway through.

use std::collections::HashSet;

use crate::table::{hash_str, Table};
use crate::value::{Function, Value};

/// A safe handle to a heap-allocated object.
/// This acts as an index into the Heap's object storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(pub usize);

/// An interned heap string with its precomputed FNV-1a hash. At most one
/// lives on the heap per distinct byte sequence.
#[derive(Debug, Clone)]
pub struct LoxString {
    pub chars: String,
    pub hash: u32,
}

/// A captured variable. Open upvalues alias a live stack slot; closed
/// upvalues own the value. The transition is one-way.
#[derive(Debug, Clone)]
pub enum Upvalue {
    Open(usize),
    Closed(Value),
}

/// Closure object: a function plus its captured upvalues
#[derive(Debug, Clone)]
pub struct Closure {
    pub function: Handle,
    pub upvalues: Vec<Handle>,
}

/// Class object. Methods map interned names to closures; a subclass
/// starts from a copy of its superclass's table and overrides on top.
#[derive(Clone)]
pub struct Class {
    pub name: Handle,
    pub methods: Table,
}

/// Instance object. Fields are created on first assignment.
#[derive(Clone)]
pub struct Instance {
    pub class: Handle,
    pub fields: Table,
}

/// A receiver paired with a method closure
#[derive(Clone)]
pub struct BoundMethod {
    pub receiver: Value,
    pub method: Handle,
}

pub enum Object {
    String(LoxString),
    Function(Function),
    Closure(Closure),
    Upvalue(Upvalue),
    Class(Class),
    Instance(Instance),
    BoundMethod(BoundMethod),
}

impl Object {
    /// Handles reachable from this object; the blacken step of the mark
    /// phase greys each of these.
    pub fn children(&self) -> Vec<Handle> {
        match self {
            Object::String(_) => vec![],
            Object::Function(f) => {
                let mut children = Vec::new();
                if let Some(name) = f.name {
                    children.push(name);
                }
                for constant in &f.chunk.constants {
                    children.extend(constant.children());
                }
                children
            }
            Object::Closure(c) => {
                let mut children = vec![c.function];
                children.extend(c.upvalues.iter().copied());
                children
            }
            Object::Upvalue(u) => match u {
                // Open upvalues point into the stack, which the VM traces.
                Upvalue::Open(_) => vec![],
                Upvalue::Closed(v) => v.children(),
            },
            Object::Class(c) => {
                let mut children = vec![c.name];
                for (key, value) in c.methods.iter() {
                    children.push(key);
                    children.extend(value.children());
                }
                children
            }
            Object::Instance(i) => {
                let mut children = vec![i.class];
                for (key, value) in i.fields.iter() {
                    children.push(key);
                    children.extend(value.children());
                }
                children
            }
            Object::BoundMethod(b) => {
                let mut children = b.receiver.children();
                children.push(b.method);
                children
            }
        }
    }

    /// Rough heap footprint, used only to drive the collection threshold
    pub fn size_bytes(&self) -> usize {
        let base = std::mem::size_of::<Object>();
        match self {
            Object::String(s) => base + s.chars.len(),
            Object::Function(f) => {
                base + f.chunk.code.len() + f.chunk.constants.len() * std::mem::size_of::<Value>()
            }
            Object::Closure(c) => base + c.upvalues.len() * std::mem::size_of::<Handle>(),
            Object::Upvalue(_) => base,
            Object::Class(c) => {
                base + c.methods.len() * (std::mem::size_of::<Handle>() + std::mem::size_of::<Value>())
            }
            Object::Instance(i) => {
                base + i.fields.len() * (std::mem::size_of::<Handle>() + std::mem::size_of::<Value>())
            }
            Object::BoundMethod(_) => base,
        }
    }
}

/// Collection threshold floor and initial value
const GC_FLOOR: usize = 1024 * 1024;

pub struct Heap {
    objects: Vec<Option<Object>>,
    free_list: Vec<usize>,
    marked: HashSet<usize>,
    grey_stack: Vec<Handle>,

    /// Interned strings. The table holds weak references: the sweep prunes
    /// any entry whose key was not marked.
    strings: Table,

    pub bytes_allocated: usize,
    pub next_gc: usize,

    /// When set, the VM collects at every instruction dispatch
    pub stress: bool,
}

impl Heap {
    pub fn new() -> Self {
        Self {
            objects: Vec::new(),
            free_list: Vec::new(),
            marked: HashSet::new(),
            grey_stack: Vec::new(),
            strings: Table::new(),
            bytes_allocated: 0,
            next_gc: GC_FLOOR,
            stress: false,
        }
    }

    /// Intern a string: return the existing handle for these bytes, or
    /// allocate a fresh string object and remember it.
    pub fn intern(&mut self, chars: &str) -> Handle {
        let hash = hash_str(chars);
        let Heap {
            strings, objects, ..
        } = self;
        let existing = strings.find_key(hash, |key| match objects.get(key.0) {
            Some(Some(Object::String(s))) => s.chars == chars,
            _ => false,
        });
        if let Some(handle) = existing {
            return handle;
        }

        let handle = self.alloc(Object::String(LoxString {
            chars: chars.to_string(),
            hash,
        }));
        self.strings.set(handle, hash, Value::Nil);
        handle
    }

    pub fn alloc_function(&mut self, function: Function) -> Handle {
        self.alloc(Object::Function(function))
    }

    pub fn alloc_closure(&mut self, function: Handle, upvalues: Vec<Handle>) -> Handle {
        self.alloc(Object::Closure(Closure { function, upvalues }))
    }

    pub fn alloc_upvalue(&mut self, slot: usize) -> Handle {
        self.alloc(Object::Upvalue(Upvalue::Open(slot)))
    }

    pub fn alloc_class(&mut self, name: Handle) -> Handle {
        self.alloc(Object::Class(Class {
            name,
            methods: Table::new(),
        }))
    }

    pub fn alloc_instance(&mut self, class: Handle) -> Handle {
        self.alloc(Object::Instance(Instance {
            class,
            fields: Table::new(),
        }))
    }

    pub fn alloc_bound_method(&mut self, receiver: Value, method: Handle) -> Handle {
        self.alloc(Object::BoundMethod(BoundMethod { receiver, method }))
    }

    fn alloc(&mut self, object: Object) -> Handle {
        self.bytes_allocated += object.size_bytes();

        if let Some(index) = self.free_list.pop() {
            self.objects[index] = Some(object);
            Handle(index)
        } else {
            let index = self.objects.len();
            self.objects.push(Some(object));
            Handle(index)
        }
    }

    pub fn get_string(&self, handle: Handle) -> Option<&LoxString> {
        match self.objects.get(handle.0)? {
            Some(Object::String(s)) => Some(s),
            _ => None,
        }
    }

    /// The precomputed hash of an interned string
    pub fn string_hash(&self, handle: Handle) -> u32 {
        self.get_string(handle).map(|s| s.hash).unwrap_or(0)
    }

    pub fn get_function(&self, handle: Handle) -> Option<&Function> {
        match self.objects.get(handle.0)? {
            Some(Object::Function(f)) => Some(f),
            _ => None,
        }
    }

    pub fn get_closure(&self, handle: Handle) -> Option<&Closure> {
        match self.objects.get(handle.0)? {
            Some(Object::Closure(c)) => Some(c),
            _ => None,
        }
    }

    pub fn get_upvalue(&self, handle: Handle) -> Option<&Upvalue> {
        match self.objects.get(handle.0)? {
            Some(Object::Upvalue(u)) => Some(u),
            _ => None,
        }
    }

    pub fn get_upvalue_mut(&mut self, handle: Handle) -> Option<&mut Upvalue> {
        match self.objects.get_mut(handle.0)? {
            Some(Object::Upvalue(u)) => Some(u),
            _ => None,
        }
    }

    pub fn get_class(&self, handle: Handle) -> Option<&Class> {
        match self.objects.get(handle.0)? {
            Some(Object::Class(c)) => Some(c),
            _ => None,
        }
    }

    pub fn get_class_mut(&mut self, handle: Handle) -> Option<&mut Class> {
        match self.objects.get_mut(handle.0)? {
            Some(Object::Class(c)) => Some(c),
            _ => None,
        }
    }

    pub fn get_instance(&self, handle: Handle) -> Option<&Instance> {
        match self.objects.get(handle.0)? {
            Some(Object::Instance(i)) => Some(i),
            _ => None,
        }
    }

    pub fn get_instance_mut(&mut self, handle: Handle) -> Option<&mut Instance> {
        match self.objects.get_mut(handle.0)? {
            Some(Object::Instance(i)) => Some(i),
            _ => None,
        }
    }

    pub fn get_bound_method(&self, handle: Handle) -> Option<&BoundMethod> {
        match self.objects.get(handle.0)? {
            Some(Object::BoundMethod(b)) => Some(b),
            _ => None,
        }
    }

    pub fn should_collect(&self) -> bool {
        self.stress || self.bytes_allocated > self.next_gc
    }

    pub fn is_marked(&self, handle: Handle) -> bool {
        self.marked.contains(&handle.0)
    }

    /// Grey an object: mark it and queue it for blackening. Idempotent.
    pub fn mark(&mut self, handle: Handle) {
        if self.marked.contains(&handle.0) {
            return;
        }
        if self.objects.get(handle.0).and_then(|o| o.as_ref()).is_some() {
            self.marked.insert(handle.0);
            self.grey_stack.push(handle);
        }
    }

    /// Drain the grey worklist, greying everything reachable from each
    /// entry.
    pub fn trace_references(&mut self) {
        while let Some(handle) = self.grey_stack.pop() {
            // Extract the children first; marking needs &mut self.
            let children = match self.objects.get(handle.0) {
                Some(Some(object)) => object.children(),
                _ => Vec::new(),
            };
            for child in children {
                self.mark(child);
            }
        }
    }

    /// Free every unmarked object and reset the mark state. The interned
    /// string table is pruned first so it never resurrects a dead string.
    pub fn sweep(&mut self) {
        let Heap {
            strings, marked, ..
        } = self;
        strings.retain_keys(|key| marked.contains(&key.0));

        let mut freed = 0;
        for index in 0..self.objects.len() {
            if self.marked.contains(&index) {
                continue;
            }
            if let Some(object) = &self.objects[index] {
                freed += object.size_bytes();
                self.objects[index] = None;
                self.free_list.push(index);
            }
        }

        self.bytes_allocated -= freed;
        self.marked.clear();
        self.next_gc = std::cmp::max(self.bytes_allocated * 2, GC_FLOOR);
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    #[test]
    fn test_interning_dedupes() {
        let mut heap = Heap::new();
        let a = heap.intern("hello");
        let b = heap.intern("hello");
        let c = heap.intern("world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.get_string(a).unwrap().chars, "hello");
    }

    #[test]
    fn test_string_hash_is_fnv1a() {
        let mut heap = Heap::new();
        let h = heap.intern("foobar");
        assert_eq!(heap.string_hash(h), hash_str("foobar"));
    }

    #[test]
    fn test_sweep_frees_unmarked() {
        let mut heap = Heap::new();
        let keep = heap.intern("keep");
        let drop = heap.intern("drop");

        heap.mark(keep);
        heap.trace_references();
        heap.sweep();

        assert!(heap.get_string(keep).is_some());
        assert!(heap.get_string(drop).is_none());
        // The dead string left the intern table, so re-interning the same
        // bytes allocates fresh.
        let again = heap.intern("drop");
        assert!(heap.get_string(again).is_some());
    }

    #[test]
    fn test_trace_reaches_closure_graph() {
        let mut heap = Heap::new();
        let name = heap.intern("f");
        let function = heap.alloc_function(Function {
            name: Some(name),
            arity: 0,
            upvalue_count: 1,
            chunk: Rc::new(crate::bytecode::Chunk::new()),
        });
        let upvalue = heap.alloc_upvalue(0);
        let closure = heap.alloc_closure(function, vec![upvalue]);

        heap.mark(closure);
        heap.trace_references();

        assert!(heap.is_marked(closure));
        assert!(heap.is_marked(function));
        assert!(heap.is_marked(upvalue));
        assert!(heap.is_marked(name));
        heap.sweep();
        assert!(heap.get_closure(closure).is_some());
    }

    #[test]
    fn test_free_list_reuses_slots() {
        let mut heap = Heap::new();
        let dead = heap.intern("transient");
        heap.sweep();
        let reused = heap.intern("fresh");
        assert_eq!(dead.0, reused.0);
    }
}
