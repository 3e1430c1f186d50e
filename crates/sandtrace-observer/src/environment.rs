//! Environment handed to processes spawned by a monitored process.

use sandtrace_common::config::BootstrapEnv;
use sandtrace_common::constants::{
    ENV_FORCED_TRACE_PROCESSES, ENV_INTERPOSER_PATH, ENV_MANIFEST_PATH, ENV_ROOT_PID,
    ENV_TRACED_PATH, ENV_TRACED_PID, LD_PRELOAD,
};

const BOOTSTRAP_VARS: [&str; 6] = [
    ENV_MANIFEST_PATH,
    ENV_ROOT_PID,
    ENV_FORCED_TRACE_PROCESSES,
    ENV_TRACED_PID,
    ENV_TRACED_PATH,
    ENV_INTERPOSER_PATH,
];

/// Rewrites a parent environment for a child process.
///
/// With `monitor_children` set the child inherits the bootstrap variables
/// and the interposer is present in `LD_PRELOAD`; otherwise every trace of
/// interception is removed. The root-pid and traced-process variables are
/// never inherited: only the step's root is its own root.
#[must_use]
pub fn child_environment<I>(
    bootstrap: &BootstrapEnv,
    monitor_children: bool,
    parent: I,
) -> Vec<(String, String)>
where
    I: IntoIterator<Item = (String, String)>,
{
    let interposer = bootstrap
        .interposer_path
        .as_deref()
        .map(|path| path.to_string_lossy().into_owned());

    let mut preload: Option<String> = None;
    let mut vars: Vec<(String, String)> = Vec::new();
    for (key, value) in parent {
        if key == LD_PRELOAD {
            preload = Some(value);
        } else if !BOOTSTRAP_VARS.contains(&key.as_str()) {
            vars.push((key, value));
        }
    }

    let mut preload_entries: Vec<String> = preload
        .as_deref()
        .unwrap_or_default()
        .split([':', ' '])
        .filter(|entry| !entry.is_empty())
        .map(str::to_owned)
        .collect();

    if let Some(interposer) = &interposer {
        preload_entries.retain(|entry| entry != interposer);
        if monitor_children {
            preload_entries.push(interposer.clone());
        }
    }
    if !preload_entries.is_empty() {
        vars.push((LD_PRELOAD.to_owned(), preload_entries.join(":")));
    }

    if monitor_children {
        vars.extend(
            bootstrap
                .to_vars()
                .into_iter()
                .filter(|(key, _)| key != ENV_ROOT_PID),
        );
    }
    vars
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn bootstrap() -> BootstrapEnv {
        BootstrapEnv {
            manifest_path: PathBuf::from("/run/st/manifest.json"),
            root_pid: Some(1),
            forced_trace_processes: vec!["go".into()],
            traced: None,
            interposer_path: Some(PathBuf::from("/opt/st/libinterpose.so")),
        }
    }

    fn lookup<'a>(vars: &'a [(String, String)], key: &str) -> Option<&'a str> {
        vars.iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn parent() -> Vec<(String, String)> {
        vec![
            ("PATH".into(), "/usr/bin".into()),
            (ENV_ROOT_PID.into(), "1".into()),
            (LD_PRELOAD.into(), "/lib/other.so".into()),
        ]
    }

    #[test]
    fn monitored_children_inherit_interception() {
        let vars = child_environment(&bootstrap(), true, parent());
        assert_eq!(
            lookup(&vars, LD_PRELOAD),
            Some("/lib/other.so:/opt/st/libinterpose.so")
        );
        assert_eq!(
            lookup(&vars, ENV_MANIFEST_PATH),
            Some("/run/st/manifest.json")
        );
        assert_eq!(lookup(&vars, ENV_FORCED_TRACE_PROCESSES), Some("go"));
        assert_eq!(lookup(&vars, "PATH"), Some("/usr/bin"));
    }

    #[test]
    fn root_pid_is_never_inherited() {
        let vars = child_environment(&bootstrap(), true, parent());
        assert_eq!(lookup(&vars, ENV_ROOT_PID), None);
    }

    #[test]
    fn unmonitored_children_lose_interception() {
        let mut env = parent();
        env[2].1 = "/opt/st/libinterpose.so /lib/other.so".into();
        env.push((ENV_MANIFEST_PATH.into(), "/run/st/manifest.json".into()));

        let vars = child_environment(&bootstrap(), false, env);
        assert_eq!(lookup(&vars, LD_PRELOAD), Some("/lib/other.so"));
        assert_eq!(lookup(&vars, ENV_MANIFEST_PATH), None);
    }

    #[test]
    fn interposer_is_not_duplicated() {
        let mut env = parent();
        env[2].1 = "/opt/st/libinterpose.so".into();
        let vars = child_environment(&bootstrap(), true, env);
        assert_eq!(lookup(&vars, LD_PRELOAD), Some("/opt/st/libinterpose.so"));
    }

    #[test]
    fn empty_preload_is_dropped() {
        let mut env = parent();
        env[2].1 = "/opt/st/libinterpose.so".into();
        let vars = child_environment(&bootstrap(), false, env);
        assert_eq!(lookup(&vars, LD_PRELOAD), None);
    }
}
