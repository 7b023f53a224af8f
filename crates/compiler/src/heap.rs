/// Stable integer ids for array/tuple *type descriptors* referenced by IR.
/// True heap objects for runtime values are reserved future work (see
/// `Opcode::MakeArray`/`MakeTuple`/`AccessField`).
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq)]
pub enum Descriptor {
    Array { element_lexeme: String },
    Tuple { element_lexemes: Vec<String> },
}

#[derive(Debug, Default)]
pub struct HeapAllocator {
    items: HashMap<i32, Descriptor>,
    free_list: Vec<i32>,
    next: i32,
}

impl HeapAllocator {
    pub fn new() -> Self {
        HeapAllocator::default()
    }

    pub fn allocate(&mut self, descriptor: Descriptor) -> i32 {
        let id = self.salvage_free_gap_id().unwrap_or_else(|| self.next_id());
        self.items.insert(id, descriptor);
        id
    }

    /// Returns `false` on a double release (the id is no longer live).
    pub fn release(&mut self, id: i32) -> bool {
        if self.items.remove(&id).is_none() {
            return false;
        }
        self.free_list.push(id);
        true
    }

    pub fn lookup(&self, id: i32) -> Option<&Descriptor> {
        self.items.get(&id)
    }

    fn next_id(&mut self) -> i32 {
        let id = self.next;
        self.next += 1;
        id
    }

    fn salvage_free_gap_id(&mut self) -> Option<i32> {
        self.free_list.pop()
    }
}
