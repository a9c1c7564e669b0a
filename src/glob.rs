//! # Glob
//!
//! Restricted glob matching for kernel function names. The only wildcard
//! is `*` and it may appear as the first and/or last character of a
//! pattern only; `**` is rejected.

use anyhow::Result;

use crate::Error;

/// A validated function-name pattern, together with the number of
/// functions it matched during selection.
#[derive(Clone, Debug)]
pub struct Glob {
    pattern: String,
    matches: u64,
}

impl Glob {
    /// Validate and build a glob.
    pub fn new(pattern: &str) -> Result<Glob> {
        let n = pattern.len();

        if n == 0 {
            return Err(Error::InvalidArgument("empty glob".to_string()).into());
        }
        if pattern == "**" {
            return Err(
                Error::InvalidArgument(format!("unsupported glob '{pattern}'")).into(),
            );
        }
        if pattern
            .bytes()
            .enumerate()
            .any(|(i, b)| b == b'*' && i != 0 && i != n - 1)
        {
            return Err(Error::InvalidArgument(format!(
                "unsupported glob '{pattern}': '*' is only allowed at the beginning or end"
            ))
            .into());
        }

        Ok(Glob {
            pattern: pattern.to_string(),
            matches: 0,
        })
    }

    /// Test `name` against the pattern. Comparison is byte-exact and does
    /// not allocate.
    pub fn matches(&self, name: &str) -> bool {
        let p = self.pattern.as_str();

        if p == "*" {
            return true;
        }

        match (p.starts_with('*'), p.ends_with('*')) {
            // Substring match.
            (true, true) => name.contains(&p[1..p.len() - 1]),
            // Suffix match.
            (true, false) => name.ends_with(&p[1..]),
            // Prefix match.
            (false, true) => name.starts_with(&p[..p.len() - 1]),
            // Exact match.
            (false, false) => name == p,
        }
    }

    /// Record a selection hit.
    pub(crate) fn hit(&mut self) {
        self.matches += 1;
    }

    /// The pattern this glob was built from.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// How many function names this glob matched during selection.
    pub fn match_count(&self) -> u64 {
        self.matches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation() {
        assert!(Glob::new("vfs_read").is_ok());
        assert!(Glob::new("vfs_*").is_ok());
        assert!(Glob::new("*_read").is_ok());
        assert!(Glob::new("*vfs*").is_ok());
        assert!(Glob::new("*").is_ok());

        assert!(Glob::new("").is_err());
        assert!(Glob::new("**").is_err());
        assert!(Glob::new("vfs*read").is_err());
        assert!(Glob::new("a*b*c").is_err());
    }

    #[test]
    fn universal() {
        let g = Glob::new("*").unwrap();
        assert!(g.matches(""));
        assert!(g.matches("x"));
        assert!(g.matches("tcp_sendmsg"));
    }

    #[test]
    fn exact() {
        let g = Glob::new("vfs_read").unwrap();
        assert!(g.matches("vfs_read"));
        assert!(!g.matches("vfs_readv"));
        assert!(!g.matches("_vfs_read"));
    }

    #[test]
    fn prefix() {
        let g = Glob::new("vfs_*").unwrap();
        assert!(g.matches("vfs_read"));
        assert!(g.matches("vfs_"));
        assert!(!g.matches("vf"));
        assert!(!g.matches("xvfs_read"));
    }

    #[test]
    fn suffix() {
        let g = Glob::new("*_sys_select").unwrap();
        assert!(g.matches("__x64_sys_select"));
        assert!(g.matches("_sys_select"));
        // Too short for the suffix.
        assert!(!g.matches("sys_select"));
        assert!(!g.matches("__x64_sys_selec"));
    }

    #[test]
    fn substring() {
        let g = Glob::new("*read*").unwrap();
        assert!(g.matches("vfs_read"));
        assert!(g.matches("read_iter"));
        assert!(g.matches("pread64"));
        assert!(!g.matches("vfs_write"));
    }

    #[test]
    fn match_counter() {
        let mut g = Glob::new("rcu_read_lock*").unwrap();
        assert!(g.match_count() == 0);
        if g.matches("rcu_read_lock") {
            g.hit();
        }
        if g.matches("rcu_read_lock_bh") {
            g.hit();
        }
        if g.matches("rcu_read_unlock") {
            g.hit();
        }
        assert!(g.match_count() == 2);
    }
}
