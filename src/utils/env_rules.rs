//! Environment rule engine
//!
//! Builds the exact environment handed to the sandboxed program from an
//! ordered list of rules. Built-in rules always run first, then user rules in
//! command-line order. Each rule first drops any existing entry of its
//! variable, so later rules win without ever producing duplicates.

use crate::config::types::{KeeperError, Result};
use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::str::FromStr;

/// What a rule does with its variable
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnvAction {
    /// Leave the variable absent
    Clear,
    /// Set the variable to a fixed value
    Set(OsString),
    /// Copy the parent's current value, if it has one
    Inherit,
}

/// One `-E` rule
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EnvRule {
    pub name: OsString,
    pub action: EnvAction,
}

impl EnvRule {
    pub fn clear(name: impl Into<OsString>) -> Self {
        Self {
            name: name.into(),
            action: EnvAction::Clear,
        }
    }

    pub fn set(name: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        Self {
            name: name.into(),
            action: EnvAction::Set(value.into()),
        }
    }

    pub fn inherit(name: impl Into<OsString>) -> Self {
        Self {
            name: name.into(),
            action: EnvAction::Inherit,
        }
    }

    /// Parse `VAR` (inherit), `VAR=` (clear) or `VAR=value` (set)
    pub fn parse(spec: &str) -> Result<Self> {
        let rule = match spec.split_once('=') {
            None => EnvRule::inherit(spec),
            Some((name, "")) => EnvRule::clear(name),
            Some((name, value)) => EnvRule::set(name, value),
        };
        if rule.name.is_empty() {
            return Err(KeeperError::Config(format!(
                "Invalid environment specified: {}",
                spec
            )));
        }
        Ok(rule)
    }

    fn matches(&self, name: &OsStr) -> bool {
        self.name.as_os_str() == name
    }
}

impl FromStr for EnvRule {
    type Err = KeeperError;

    fn from_str(s: &str) -> Result<Self> {
        EnvRule::parse(s)
    }
}

/// Rules applied before any user rule.
/// glibc otherwise writes fatal diagnostics to the controlling tty instead of stderr.
pub fn builtin_rules() -> Vec<EnvRule> {
    vec![EnvRule::set("LIBC_FATAL_STDERR_", "1")]
}

/// Resolve the child environment.
///
/// `parent` is the real environment of the keeper, in its original order.
/// Variables taken wholesale under `inherit_full` keep the parent's order;
/// controlled variables are appended in rule order.
pub fn resolve_environment(
    user_rules: &[EnvRule],
    inherit_full: bool,
    parent: &[(OsString, OsString)],
) -> Vec<(OsString, OsString)> {
    let mut env: Vec<(OsString, OsString)> = if inherit_full {
        parent.to_vec()
    } else {
        Vec::new()
    };

    let builtins = builtin_rules();
    for rule in builtins.iter().chain(user_rules) {
        apply_rule(&mut env, rule, parent);
    }

    env
}

fn apply_rule(env: &mut Vec<(OsString, OsString)>, rule: &EnvRule, parent: &[(OsString, OsString)]) {
    env.retain(|(name, _)| !rule.matches(name));

    match &rule.action {
        EnvAction::Clear => {}
        EnvAction::Set(value) => env.push((rule.name.clone(), value.clone())),
        EnvAction::Inherit => {
            if let Some((_, value)) = parent.iter().find(|(name, _)| rule.matches(name)) {
                env.push((rule.name.clone(), value.clone()));
            }
        }
    }
}

/// Render `name=value` entries for execve
pub fn to_exec_env(env: &[(OsString, OsString)]) -> Result<Vec<CString>> {
    env.iter()
        .map(|(name, value)| {
            let mut entry = Vec::with_capacity(name.len() + value.len() + 1);
            entry.extend_from_slice(name.as_bytes());
            entry.push(b'=');
            entry.extend_from_slice(value.as_bytes());
            CString::new(entry).map_err(|_| {
                KeeperError::Config(format!(
                    "Environment variable {} contains NUL byte",
                    name.to_string_lossy()
                ))
            })
        })
        .collect()
}

/// Snapshot of the keeper's own environment
pub fn parent_environment() -> Vec<(OsString, OsString)> {
    std::env::vars_os().collect()
}

/// Human-readable form used for verbose logging
pub fn describe(env: &[(OsString, OsString)]) -> Vec<String> {
    env.iter()
        .map(|(name, value)| {
            let mut bytes = name.clone().into_vec();
            bytes.push(b'=');
            bytes.extend_from_slice(value.as_bytes());
            String::from_utf8_lossy(&bytes).into_owned()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn os(s: &str) -> OsString {
        OsString::from(s)
    }

    fn parent() -> Vec<(OsString, OsString)> {
        vec![
            (os("PATH"), os("/usr/bin:/bin")),
            (os("HOME"), os("/home/judge")),
            (os("LANG"), os("C.UTF-8")),
        ]
    }

    fn lookup<'a>(env: &'a [(OsString, OsString)], name: &str) -> Option<&'a OsString> {
        env.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    #[test]
    fn test_parse_rule_forms() {
        assert_eq!(EnvRule::parse("PATH").unwrap(), EnvRule::inherit("PATH"));
        assert_eq!(EnvRule::parse("PATH=").unwrap(), EnvRule::clear("PATH"));
        assert_eq!(
            EnvRule::parse("OPT=a=b").unwrap(),
            EnvRule::set("OPT", "a=b")
        );
    }

    #[test]
    fn test_parse_rejects_empty_name() {
        let err = EnvRule::parse("=value").unwrap_err();
        assert!(err.to_string().contains("Invalid environment specified"));
        assert!("=".parse::<EnvRule>().is_err());
    }

    #[test]
    fn test_empty_rules_yield_only_builtins() {
        let env = resolve_environment(&[], false, &parent());
        assert_eq!(env, vec![(os("LIBC_FATAL_STDERR_"), os("1"))]);
    }

    #[test]
    fn test_set_overrides_prior_state() {
        let rules = vec![EnvRule::inherit("HOME"), EnvRule::set("HOME", "/sandbox")];
        let env = resolve_environment(&rules, false, &parent());
        assert_eq!(lookup(&env, "HOME"), Some(&os("/sandbox")));
        assert_eq!(env.iter().filter(|(n, _)| n == "HOME").count(), 1);
    }

    #[test]
    fn test_inherit_after_clear_restores_parent_value() {
        let rules = vec![EnvRule::clear("PATH"), EnvRule::inherit("PATH")];
        let env = resolve_environment(&rules, true, &parent());
        assert_eq!(lookup(&env, "PATH"), Some(&os("/usr/bin:/bin")));
    }

    #[test]
    fn test_inherit_ignores_earlier_set() {
        let rules = vec![EnvRule::set("PATH", "/opt"), EnvRule::inherit("PATH")];
        let env = resolve_environment(&rules, false, &parent());
        assert_eq!(lookup(&env, "PATH"), Some(&os("/usr/bin:/bin")));
    }

    #[test]
    fn test_inherit_missing_variable_stays_absent() {
        let rules = vec![EnvRule::inherit("NOT_THERE")];
        let env = resolve_environment(&rules, false, &parent());
        assert!(lookup(&env, "NOT_THERE").is_none());
    }

    #[test]
    fn test_clear_removes_inherited_variable() {
        let rules = vec![EnvRule::clear("HOME")];
        let env = resolve_environment(&rules, true, &parent());
        assert!(lookup(&env, "HOME").is_none());
        assert!(lookup(&env, "PATH").is_some());
    }

    #[test]
    fn test_user_rule_can_override_builtin() {
        let rules = vec![EnvRule::clear("LIBC_FATAL_STDERR_")];
        let env = resolve_environment(&rules, false, &parent());
        assert!(env.is_empty());
    }

    #[test]
    fn test_full_inherit_keeps_parent_order() {
        let env = resolve_environment(&[EnvRule::set("X", "1")], true, &parent());
        let names: Vec<_> = env.iter().map(|(n, _)| n.to_string_lossy().into_owned()).collect();
        assert_eq!(names, vec!["PATH", "HOME", "LANG", "LIBC_FATAL_STDERR_", "X"]);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let rules = vec![
            EnvRule::inherit("LANG"),
            EnvRule::set("A", "1"),
            EnvRule::clear("HOME"),
            EnvRule::set("B", "2"),
        ];
        let first = resolve_environment(&rules, false, &parent());
        let second = resolve_environment(&rules, false, &parent());
        assert_eq!(first, second);
        assert_eq!(
            describe(&first),
            vec!["LIBC_FATAL_STDERR_=1", "LANG=C.UTF-8", "A=1", "B=2"]
        );
    }

    #[test]
    fn test_exec_env_rendering() {
        let env = vec![(os("A"), os("x y")), (os("EMPTY"), os(""))];
        let rendered = to_exec_env(&env).unwrap();
        assert_eq!(rendered[0].as_bytes(), b"A=x y");
        assert_eq!(rendered[1].as_bytes(), b"EMPTY=");
    }
}
