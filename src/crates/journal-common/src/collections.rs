//! Hash-based collections used throughout the journal crates.

pub type HashMap<K, V> = rustc_hash::FxHashMap<K, V>;
pub type HashSet<T> = rustc_hash::FxHashSet<T>;
pub type VecDeque<T> = std::collections::VecDeque<T>;
