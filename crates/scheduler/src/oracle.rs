//! Compile oracles: what a compilation is allowed to know about the rest of
//! the traversal.
//!
//! Non-pipelined compilations get the opaque [`CompileOracle::Simple`]
//! capability. Pipelined ones get a [`PipeliningOracle`] carrying the
//! transitive upstream signatures in classpath-lookup order, the macro
//! symbols those upstreams define, and the promise this compilation must
//! fulfil so its own downstreams can start early.

use std::collections::HashSet;

use derive_more::Display;

use crate::{promise::Promise, task::SharedTask};

/// A memoized task resolving to the aggregated [`JavaSignal`] of a node's
/// transitive upstreams.
pub type JavaSignalTask = SharedTask<JavaSignal>;

/// A compact type-interface summary of one top-level definition, enough to
/// unblock downstream compilation before bytecode exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Fully qualified name of the definition.
    pub name: String,
    /// Digest of the definition's public interface.
    pub digest: u64,
}

/// What a pipelined compilation publishes when its signatures are ready.
#[derive(Debug, Clone, Default)]
pub struct Signatures {
    /// The signatures, in the producer's declaration order.
    pub signatures: Vec<Signature>,
    /// Macro symbols defined by the producing project.
    pub defined_macro_symbols: Vec<String>,
}

/// An insertion-ordered signature table with classpath shadowing semantics:
/// on a name collision the first occurrence wins.
#[derive(Debug, Clone, Default)]
pub struct SignatureTable {
    entries: Vec<Signature>,
    names: HashSet<String>,
}

impl SignatureTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts every signature that does not collide with an earlier name.
    pub fn extend_first_occurrence(&mut self, signatures: &[Signature]) {
        for signature in signatures {
            if self.names.insert(signature.name.clone()) {
                self.entries.push(signature.clone());
            }
        }
    }

    /// The visible signatures, in insertion order.
    pub fn signatures(&self) -> &[Signature] {
        &self.entries
    }

    /// Number of visible signatures.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Whether a pipelined compilation may run its Java phase.
///
/// Aggregated over upstream finished-compilation outcomes by a left-to-right
/// fold: `Continue` is the identity, and any failure absorbs into a
/// `FailFast` accumulating the failed project names.
#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum JavaSignal {
    /// Every upstream finished successfully.
    #[display("continue")]
    ContinueCompilation,
    /// At least one upstream failed; the Java phase must be aborted.
    #[display("fail-fast({})", _0.join(", "))]
    FailFastCompilation(Vec<String>),
}

impl JavaSignal {
    /// Folds another outcome into this signal.
    #[must_use]
    pub fn merge(self, other: Self) -> Self {
        match (self, other) {
            (Self::ContinueCompilation, Self::ContinueCompilation) => Self::ContinueCompilation,
            (Self::FailFastCompilation(mut left), Self::FailFastCompilation(right)) => {
                left.extend(right);
                Self::FailFastCompilation(left)
            }
            (Self::FailFastCompilation(failed), Self::ContinueCompilation)
            | (Self::ContinueCompilation, Self::FailFastCompilation(failed)) => {
                Self::FailFastCompilation(failed)
            }
        }
    }
}

/// Per-upstream macro symbol listing, in DFS (classpath) order.
pub type DefinedMacros = Vec<(String, Vec<String>)>;

/// The capability handed to the compiler for one attempt.
#[derive(Debug)]
pub enum CompileOracle {
    /// Opaque capability used during non-pipelined compilation.
    Simple,
    /// Pipelining capability.
    Pipelining(PipeliningOracle),
}

impl CompileOracle {
    /// Collects every macro symbol defined by upstream projects, in
    /// classpath order. Empty for the simple oracle.
    pub fn collect_defined_macro_symbols(&self) -> Vec<String> {
        match self {
            Self::Simple => Vec::new(),
            Self::Pipelining(oracle) => oracle
                .defined_macro_symbols
                .iter()
                .flat_map(|(_, symbols)| symbols.iter().cloned())
                .collect(),
        }
    }
}

/// What a pipelined compilation knows about its upstreams and owes its
/// downstreams.
#[derive(Debug)]
pub struct PipeliningOracle {
    /// Transitive upstream signatures in DFS order, first occurrence wins.
    pub upstream_signatures: SignatureTable,
    /// Macro symbols defined per upstream project, in the same order.
    pub defined_macro_symbols: DefinedMacros,
    /// The promise this producer fulfils with its own signatures; readers
    /// are the pipelined downstreams of this compilation.
    pub own_signatures: Promise<Signatures>,
    /// Names of the upstream partial successes this compilation depends on.
    pub upstream_successes: Vec<String>,
}
