//! The concurrent symbol table: per scope, a hash trie whose nodes hold
//! `{name, symbol, child[4]}`. Descent consumes the top two bits of the
//! 64-bit XXH3 name hash per level. Nodes are installed by CAS on the parent
//! child slot; a losing install is rolled back by freeing the speculative
//! node. Replacing the symbol on an occupied slot is a retry loop: swap the
//! symbol pointer to null, consult the replacement policy, CAS the winner
//! back in.
//!
//! The table never frees entries while linking; everything is reclaimed when
//! the table is dropped.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Mutex;

use xxhash_rust::xxh3::xxh3_64;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SymbolScope {
    Defined = 0,
    Lib = 1,
}

/// Where a symbol's definition lives. `Defined` and `Undef` index into the
/// link context's object list, `Lib` into its library list.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SymbolLoc {
    Defined { obj: u32, symbol_idx: u32 },
    Lib { lib: u32, member_off: u64 },
    Undef { obj: u32 },
}

#[derive(Debug)]
pub struct Symbol {
    pub name: String,
    pub loc: SymbolLoc,
}

impl Symbol {
    pub fn defined(&self) -> (u32, u32) {
        match self.loc {
            SymbolLoc::Defined { obj, symbol_idx } => (obj, symbol_idx),
            _ => panic!("symbol {} is not in the defined scope", self.name),
        }
    }
}

/// Decides which of two same-name symbols remains the leader and applies the
/// loser's side effects. Implemented by the COMDAT/weak selector.
pub trait ReplacePolicy: Sync {
    /// True when `src` should replace `dst`.
    fn can_replace(&self, scope: SymbolScope, dst: &Symbol, src: &Symbol) -> bool;
    /// Called once per defeated symbol with the surviving leader.
    fn on_replace(&self, scope: SymbolScope, loser: &Symbol, winner: &Symbol);
}

struct TrieNode {
    name: String,
    symbol: AtomicPtr<Symbol>,
    child: [AtomicPtr<TrieNode>; 4],
}

impl TrieNode {
    fn new(name: String, symbol: *mut Symbol) -> Self {
        Self {
            name,
            symbol: AtomicPtr::new(symbol),
            child: Default::default(),
        }
    }
}

pub struct SymbolTable {
    scopes: [AtomicPtr<TrieNode>; 2],
    /// Every symbol ever allocated, for reclamation on drop. Losers of
    /// replacement fights stay reachable from here only.
    symbols: Mutex<Vec<*mut Symbol>>,
}

unsafe impl Send for SymbolTable {}
unsafe impl Sync for SymbolTable {}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            scopes: Default::default(),
            symbols: Mutex::new(Vec::new()),
        }
    }

    fn alloc_symbol(&self, name: String, loc: SymbolLoc) -> *mut Symbol {
        let symbol = Box::into_raw(Box::new(Symbol { name, loc }));
        self.symbols.lock().unwrap().push(symbol);
        symbol
    }

    /// Inserts `name -> loc`, or on a name collision lets `policy` decide the
    /// leader and side-effect the loser. Callable from any worker thread.
    pub fn insert_or_replace(
        &self,
        scope: SymbolScope,
        name: &str,
        loc: SymbolLoc,
        policy: &dyn ReplacePolicy,
    ) {
        let symbol = self.alloc_symbol(name.to_owned(), loc);
        let hash = xxh3_64(name.as_bytes());

        let mut slot = &self.scopes[scope as usize];
        let mut h = hash;
        loop {
            let mut node = slot.load(Ordering::Acquire);

            if node.is_null() {
                let fresh = Box::into_raw(Box::new(TrieNode::new(name.to_owned(), symbol)));
                match slot.compare_exchange(
                    ptr::null_mut(),
                    fresh,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return,
                    Err(installed) => {
                        // another worker raced the install; roll back ours
                        drop(unsafe { Box::from_raw(fresh) });
                        node = installed;
                    }
                }
            }

            let node_ref = unsafe { &*node };
            if node_ref.name == name {
                self.replace_fight(scope, node_ref, symbol, policy);
                return;
            }

            slot = &node_ref.child[(h >> 62) as usize];
            h <<= 2;
        }
    }

    /// The replacement retry loop: acquire the slot by swapping null in,
    /// decide the leader, then try to publish it. If a third worker claimed
    /// the slot between our swap and CAS, rerun with the decided leader.
    fn replace_fight(
        &self,
        scope: SymbolScope,
        node: &TrieNode,
        symbol: *mut Symbol,
        policy: &dyn ReplacePolicy,
    ) {
        let mut src = symbol;
        loop {
            let current = node.symbol.swap(ptr::null_mut(), Ordering::AcqRel);
            let leader = if current.is_null() {
                src
            } else {
                let (current_ref, src_ref) = unsafe { (&*current, &*src) };
                if policy.can_replace(scope, current_ref, src_ref) {
                    policy.on_replace(scope, current_ref, src_ref);
                    src
                } else {
                    policy.on_replace(scope, src_ref, current_ref);
                    current
                }
            };
            match node.symbol.compare_exchange(
                ptr::null_mut(),
                leader,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(_) => src = leader,
            }
        }
    }

    /// Wait-free lookup of the current leader for `name`.
    pub fn search(&self, scope: SymbolScope, name: &str) -> Option<&Symbol> {
        let hash = xxh3_64(name.as_bytes());
        let mut slot = &self.scopes[scope as usize];
        let mut h = hash;
        loop {
            let node = slot.load(Ordering::Acquire);
            if node.is_null() {
                return None;
            }
            let node_ref = unsafe { &*node };
            if node_ref.name == name {
                // a replacement fight holds the slot for a few instructions
                loop {
                    let symbol = node_ref.symbol.load(Ordering::Acquire);
                    if !symbol.is_null() {
                        return Some(unsafe { &*symbol });
                    }
                    std::hint::spin_loop();
                }
            }
            slot = &node_ref.child[(h >> 62) as usize];
            h <<= 2;
        }
    }

    /// Collects every live symbol of a scope. Safe only after ingest is
    /// complete; the iteration order is not deterministic and callers must
    /// sort before consuming.
    pub fn iter_scope(&self, scope: SymbolScope) -> Vec<&Symbol> {
        let mut out = Vec::new();
        let mut stack = vec![&self.scopes[scope as usize]];
        while let Some(slot) = stack.pop() {
            let node = slot.load(Ordering::Acquire);
            if node.is_null() {
                continue;
            }
            let node_ref = unsafe { &*node };
            let symbol = node_ref.symbol.load(Ordering::Acquire);
            if !symbol.is_null() {
                out.push(unsafe { &*symbol });
            }
            for child in &node_ref.child {
                stack.push(child);
            }
        }
        out
    }

    /// Points `name` at a new location, bypassing the replacement policy.
    /// The weak finalizer uses this to replace weak symbols with their
    /// resolved targets. Returns false when the name is absent.
    pub fn rebind(&self, scope: SymbolScope, name: &str, loc: SymbolLoc) -> bool {
        let hash = xxh3_64(name.as_bytes());
        let mut slot = &self.scopes[scope as usize];
        let mut h = hash;
        loop {
            let node = slot.load(Ordering::Acquire);
            if node.is_null() {
                return false;
            }
            let node_ref = unsafe { &*node };
            if node_ref.name == name {
                let symbol = self.alloc_symbol(name.to_owned(), loc);
                node_ref.symbol.store(symbol, Ordering::Release);
                return true;
            }
            slot = &node_ref.child[(h >> 62) as usize];
            h <<= 2;
        }
    }
}

impl Drop for SymbolTable {
    fn drop(&mut self) {
        fn free_node(node: *mut TrieNode) {
            if node.is_null() {
                return;
            }
            let node = unsafe { Box::from_raw(node) };
            for child in &node.child {
                free_node(child.load(Ordering::Relaxed));
            }
        }
        for scope in &self.scopes {
            free_node(scope.load(Ordering::Relaxed));
        }
        for symbol in self.symbols.lock().unwrap().drain(..) {
            drop(unsafe { Box::from_raw(symbol) });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linker::pool::ThreadPool;

    /// Earlier object index wins; no side effects.
    struct EarlierWins;
    impl ReplacePolicy for EarlierWins {
        fn can_replace(&self, _: SymbolScope, dst: &Symbol, src: &Symbol) -> bool {
            match (dst.loc, src.loc) {
                (SymbolLoc::Defined { obj: a, .. }, SymbolLoc::Defined { obj: b, .. }) => b < a,
                _ => false,
            }
        }
        fn on_replace(&self, _: SymbolScope, _: &Symbol, _: &Symbol) {}
    }

    fn defined(obj: u32, symbol_idx: u32) -> SymbolLoc {
        SymbolLoc::Defined { obj, symbol_idx }
    }

    #[test]
    fn insert_then_search() {
        let table = SymbolTable::new();
        table.insert_or_replace(SymbolScope::Defined, "main", defined(0, 1), &EarlierWins);
        let found = table.search(SymbolScope::Defined, "main").unwrap();
        assert_eq!(found.loc, defined(0, 1));
        assert!(table.search(SymbolScope::Defined, "other").is_none());
        assert!(table.search(SymbolScope::Lib, "main").is_none());
    }

    #[test]
    fn replacement_policy_decides_leader() {
        let table = SymbolTable::new();
        table.insert_or_replace(SymbolScope::Defined, "dup", defined(4, 0), &EarlierWins);
        table.insert_or_replace(SymbolScope::Defined, "dup", defined(2, 0), &EarlierWins);
        table.insert_or_replace(SymbolScope::Defined, "dup", defined(7, 0), &EarlierWins);
        let found = table.search(SymbolScope::Defined, "dup").unwrap();
        assert_eq!(found.loc, defined(2, 0));
    }

    #[test]
    fn scopes_are_disjoint() {
        let table = SymbolTable::new();
        table.insert_or_replace(SymbolScope::Defined, "x", defined(0, 0), &EarlierWins);
        table.insert_or_replace(
            SymbolScope::Lib,
            "x",
            SymbolLoc::Lib {
                lib: 0,
                member_off: 100,
            },
            &EarlierWins,
        );
        assert_eq!(
            table.search(SymbolScope::Defined, "x").unwrap().loc,
            defined(0, 0)
        );
        assert_eq!(
            table.search(SymbolScope::Lib, "x").unwrap().loc,
            SymbolLoc::Lib {
                lib: 0,
                member_off: 100
            }
        );
    }

    #[test]
    fn rebind_bypasses_policy() {
        let table = SymbolTable::new();
        table.insert_or_replace(SymbolScope::Defined, "weak", defined(0, 3), &EarlierWins);
        assert!(table.rebind(SymbolScope::Defined, "weak", defined(5, 9)));
        assert_eq!(
            table.search(SymbolScope::Defined, "weak").unwrap().loc,
            defined(5, 9)
        );
        assert!(!table.rebind(SymbolScope::Defined, "missing", defined(0, 0)));
    }

    #[test]
    fn parallel_insert_converges_to_earliest() {
        let table = SymbolTable::new();
        let pool = ThreadPool::new(8);
        // 64 names, each inserted from 32 different "objects"
        pool.for_parallel(64 * 32, |_, item_idx| {
            let name = format!("symbol_{}", item_idx % 64);
            table.insert_or_replace(
                SymbolScope::Defined,
                &name,
                defined((item_idx / 64) as u32, 0),
                &EarlierWins,
            );
        });
        for name_idx in 0..64 {
            let name = format!("symbol_{name_idx}");
            let found = table.search(SymbolScope::Defined, &name).unwrap();
            assert_eq!(found.loc, defined(0, 0), "name {name}");
        }
        assert_eq!(table.iter_scope(SymbolScope::Defined).len(), 64);
    }
}
