use std::collections::HashMap;
use std::hash::BuildHasherDefault;

use rustc_hash::FxHasher;

pub type FastHashMap<K, V> = HashMap<K, V, BuildHasherDefault<FxHasher>>;
