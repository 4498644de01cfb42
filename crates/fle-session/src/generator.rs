//! Session code generation.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::{Rng, SeedableRng};

use fle_core::code::{MAX_CODE_NUMBER, MIN_CODE_NUMBER};

const ADJECTIVES: &[&str] = &[
    "able", "amber", "ample", "azure", "bold", "brave", "bright", "brisk", "calm", "civil",
    "clever", "cosmic", "crisp", "curious", "daring", "eager", "early", "epic", "fair", "fancy",
    "fleet", "fluent", "fond", "frank", "gentle", "giant", "glad", "golden", "grand", "happy",
    "hardy", "honest", "humble", "jolly", "keen", "kind", "lively", "loyal", "lucky", "merry",
    "mighty", "modest", "noble", "patient", "plucky", "polite", "proud", "quick", "quiet", "rapid",
    "rosy", "sharp", "shiny", "silent", "smart", "snappy", "steady", "sunny", "swift", "tidy",
    "upbeat", "vivid", "warm", "wise", "witty", "zesty",
];

const NOUNS: &[&str] = &[
    "badger", "beaver", "bison", "crane", "dingo", "dolphin", "eagle", "falcon", "ferret", "finch",
    "fox", "gecko", "gibbon", "heron", "ibex", "jaguar", "koala", "lemur", "lynx", "magpie",
    "marmot", "mole", "moose", "newt", "ocelot", "orca", "osprey", "otter", "owl", "panda",
    "parrot", "pelican", "penguin", "puffin", "quail", "rabbit", "raven", "robin", "salmon",
    "seal", "shrew", "sloth", "sparrow", "stork", "swan", "tapir", "tiger", "toucan", "turtle",
    "walrus", "whale", "wombat", "wren", "yak", "zebra",
];

/// Mints `adjective-noun-number` codes.
///
/// The RNG sits behind its own lock so generation never contends with, or
/// races against, the session store.
pub struct CodeGenerator {
    rng: Mutex<StdRng>,
}

impl CodeGenerator {
    /// Generator seeded from the OS.
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Deterministic generator for tests and reproducible runs.
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Produce one candidate code. Uniqueness is the caller's concern.
    pub fn generate(&self) -> String {
        let mut rng = self.rng.lock();
        let adjective = ADJECTIVES.choose(&mut *rng).copied().unwrap_or("happy");
        let noun = NOUNS.choose(&mut *rng).copied().unwrap_or("panda");
        let number = rng.random_range(MIN_CODE_NUMBER..=MAX_CODE_NUMBER);
        format!("{adjective}-{noun}-{number}")
    }
}

impl Default for CodeGenerator {
    fn default() -> Self {
        Self::new()
    }
}
