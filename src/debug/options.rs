//! Parser for the debug option stream.
//!
//! The stream is a `;`-separated list of groups. Each group is a run of
//! option letters followed by an optional `,`-separated list of cache name
//! globs:
//!
//! ```text
//! FZ;P,kmalloc-*,dentry;-,kmalloc-8
//! ```
//!
//! | Letter | Effect |
//! |--------|--------|
//! | `F` | consistency checks |
//! | `Z` | redzoning |
//! | `P` | poisoning |
//! | `U` | allocation/free tracking |
//! | `T` | trace every allocation and free |
//! | `A` | fail injection |
//! | `O` | skip debugging for caches whose order would grow |
//! | `-` | clear everything selected so far |
//!
//! A group without globs applies to every cache. A group without letters
//! selects `FZPU`, and so does an empty stream.

use alloc::string::{String, ToString};
use alloc::vec;
use alloc::vec::Vec;

use crate::flags::CacheFlags;
use crate::{AllocError, AllocResult};

/// Flags selected when no letters are given.
pub const DEFAULT_DEBUG_FLAGS: CacheFlags = CacheFlags::CONSISTENCY_CHECKS
    .union(CacheFlags::RED_ZONE)
    .union(CacheFlags::POISON)
    .union(CacheFlags::STORE_USER);

#[derive(Debug, Clone, PartialEq, Eq)]
struct DebugRule {
    flags: CacheFlags,
    clear: bool,
    skip_if_order_grows: bool,
    globs: Vec<String>,
}

impl DebugRule {
    fn matches(&self, name: &str) -> bool {
        self.globs.is_empty() || self.globs.iter().any(|g| glob_match(g, name))
    }
}

/// Debug settings resolved for one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DebugSelection {
    /// Debug flags to add to the cache's creation flags.
    pub flags: CacheFlags,
    /// Drop the layout-changing debug flags if they raise the order.
    pub skip_if_order_grows: bool,
}

/// Parsed debug option stream.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DebugOptions {
    rules: Vec<DebugRule>,
}

impl DebugOptions {
    /// No debugging for any cache.
    pub const fn none() -> Self {
        Self { rules: Vec::new() }
    }

    /// Parse an option stream.
    pub fn parse(input: &str) -> AllocResult<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(Self {
                rules: vec![DebugRule {
                    flags: DEFAULT_DEBUG_FLAGS,
                    clear: false,
                    skip_if_order_grows: false,
                    globs: Vec::new(),
                }],
            });
        }

        let mut rules = Vec::new();
        for group in input.split(';') {
            let group = group.trim();
            if group.is_empty() {
                continue;
            }
            let (letters, names) = group.split_once(',').unwrap_or((group, ""));
            let mut rule = parse_letters(letters.trim())?;
            rule.globs = names
                .split(',')
                .map(str::trim)
                .filter(|g| !g.is_empty())
                .map(ToString::to_string)
                .collect();
            rules.push(rule);
        }
        Ok(Self { rules })
    }

    /// Whether any group was given.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Resolve the settings for the cache called `name`. Matching groups
    /// are applied in stream order.
    pub fn flags_for(&self, name: &str) -> DebugSelection {
        let mut selection = DebugSelection::default();
        for rule in self.rules.iter().filter(|r| r.matches(name)) {
            if rule.clear {
                selection = DebugSelection::default();
            }
            selection.flags |= rule.flags;
            selection.skip_if_order_grows |= rule.skip_if_order_grows;
        }
        selection
    }
}

fn parse_letters(letters: &str) -> AllocResult<DebugRule> {
    let mut rule = DebugRule {
        flags: CacheFlags::empty(),
        clear: false,
        skip_if_order_grows: false,
        globs: Vec::new(),
    };
    if letters.is_empty() {
        rule.flags = DEFAULT_DEBUG_FLAGS;
        return Ok(rule);
    }
    for c in letters.chars() {
        match c.to_ascii_lowercase() {
            'f' => rule.flags |= CacheFlags::CONSISTENCY_CHECKS,
            'z' => rule.flags |= CacheFlags::RED_ZONE,
            'p' => rule.flags |= CacheFlags::POISON,
            'u' => rule.flags |= CacheFlags::STORE_USER,
            't' => rule.flags |= CacheFlags::TRACE,
            'a' => rule.flags |= CacheFlags::FAILSLAB,
            'o' => rule.skip_if_order_grows = true,
            '-' => {
                rule.flags = CacheFlags::empty();
                rule.skip_if_order_grows = false;
                rule.clear = true;
            }
            _ => return Err(AllocError::InvalidDebugOption(c)),
        }
    }
    Ok(rule)
}

/// Match `name` against `pattern`, where `*` matches any run of
/// characters.
fn glob_match(pattern: &str, name: &str) -> bool {
    let p = pattern.as_bytes();
    let n = name.as_bytes();
    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ni < n.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some((pi, ni));
            pi += 1;
        } else if pi < p.len() && p[pi] == n[ni] {
            pi += 1;
            ni += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == b'*')
}
