//! Property-based test generators using proptest.
//!
//! Provides strategies for edit scripts over the library model and a
//! runner that plays them against a session.

use crate::fixtures::{new_author, new_book, text};
use ormkit_core::{CoreResult, Key, Session, StorageDriver};
use proptest::prelude::*;

/// Strategy for non-empty display names.
pub fn name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[A-Z][a-z]{1,11}").expect("Invalid regex")
}

/// One step of an edit script.
///
/// Indices pick among the entities still alive and wrap around; a step
/// with nothing to act on is skipped.
#[derive(Debug, Clone)]
pub enum EditStep {
    /// Create an author.
    AddAuthor {
        /// Author name.
        name: String,
    },
    /// Create a book, filed under an author when one exists.
    AddBook {
        /// Book title.
        title: String,
        /// Author index.
        author: usize,
    },
    /// Rename an author.
    Rename {
        /// Author index.
        author: usize,
        /// New name.
        name: String,
    },
    /// Retitle a book.
    Retitle {
        /// Book index.
        book: usize,
        /// New title.
        title: String,
    },
    /// Remove a book.
    RemoveBook {
        /// Book index.
        book: usize,
    },
}

/// Strategy for a single edit step.
pub fn edit_step_strategy() -> impl Strategy<Value = EditStep> {
    prop_oneof![
        2 => name_strategy().prop_map(|name| EditStep::AddAuthor { name }),
        3 => (name_strategy(), any::<usize>()).prop_map(|(title, author)| EditStep::AddBook { title, author }),
        2 => (any::<usize>(), name_strategy()).prop_map(|(author, name)| EditStep::Rename { author, name }),
        2 => (any::<usize>(), name_strategy()).prop_map(|(book, title)| EditStep::Retitle { book, title }),
        1 => any::<usize>().prop_map(|book| EditStep::RemoveBook { book }),
    ]
}

/// Strategy for an edit script that always starts with an author.
pub fn edit_script_strategy(max_len: usize) -> impl Strategy<Value = Vec<EditStep>> {
    (name_strategy(), prop::collection::vec(edit_step_strategy(), 0..max_len)).prop_map(|(first, rest)| {
        let mut script = Vec::with_capacity(rest.len() + 1);
        script.push(EditStep::AddAuthor { name: first });
        script.extend(rest);
        script
    })
}

/// Keys produced by running a script.
#[derive(Debug, Clone, Default)]
pub struct ScriptKeys {
    /// Authors, in creation order.
    pub authors: Vec<Key>,
    /// Books still alive, in creation order.
    pub books: Vec<Key>,
    /// Books removed by the script.
    pub removed: Vec<Key>,
}

impl ScriptKeys {
    /// Every key the script created.
    pub fn all(&self) -> impl Iterator<Item = &Key> {
        self.authors.iter().chain(&self.books).chain(&self.removed)
    }
}

/// Plays `script` against `session`. Needs an open transaction unless
/// the session allows changes without one.
pub fn run_script<D: StorageDriver>(session: &mut Session<D>, script: &[EditStep]) -> CoreResult<ScriptKeys> {
    let mut keys = ScriptKeys::default();
    for step in script {
        match step {
            EditStep::AddAuthor { name } => keys.authors.push(new_author(session, name)?),
            EditStep::AddBook { title, author } => {
                let owner = pick(&keys.authors, *author).cloned();
                keys.books.push(new_book(session, title, owner.as_ref())?);
            }
            EditStep::Rename { author, name } => {
                if let Some(key) = pick(&keys.authors, *author) {
                    session.set_field(key, "name", text(name))?;
                }
            }
            EditStep::Retitle { book, title } => {
                if let Some(key) = pick(&keys.books, *book) {
                    session.set_field(key, "title", text(title))?;
                }
            }
            EditStep::RemoveBook { book } => {
                if !keys.books.is_empty() {
                    let key = keys.books.remove(book % keys.books.len());
                    session.remove_entity(&key)?;
                    keys.removed.push(key);
                }
            }
        }
    }
    Ok(keys)
}

fn pick(keys: &[Key], index: usize) -> Option<&Key> {
    if keys.is_empty() {
        None
    } else {
        keys.get(index % keys.len())
    }
}

/// Configuration for property-based tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest's config.
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
