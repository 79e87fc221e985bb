//! Structured builders for the generated sandbox scripts.
//!
//! Mounts, environment variables, and commands are plain values; rendering to
//! script text is the final serialization step, so the launch logic stays
//! testable without touching a container engine.

use std::fmt::Write as _;
use std::path::PathBuf;

/// Fixed in-container paths. Host locations vary per call; guest locations
/// never do, so generated argument bundles stay position-independent.
pub const GUEST_STORE_DIR: &str = "/content-store";
pub const GUEST_CALL_DIR: &str = "/run_call";
pub const GUEST_INPUTS_DIR: &str = "/inputs";
pub const GUEST_OUTPUTS_DIR: &str = "/outputs";

/// Environment variable exporting the store root inside the container.
pub const STORE_DIR_ENV: &str = "SPEICHER_STORE_DIR";

/// One bind mount from host into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub host: PathBuf,
    pub guest: String,
    pub readonly: bool,
}

/// One exported environment variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// The driver: decodes the kwargs bundle, invokes the target function under
/// its fixed re-exported name, and encodes the return value.
#[derive(Debug, Clone)]
pub struct DriverScript {
    pub function: String,
}

impl DriverScript {
    pub fn render(&self) -> String {
        format!(
            r#"#!/usr/bin/env python3

import json
import sys

from function_src import {function}


def main():
    with open('{call_dir}/kwargs.json') as f:
        kwargs = json.load(f)
    retval = {function}(**kwargs)
    with open('{call_dir}/retval.json', 'w') as f:
        json.dump(dict(retval=retval), f)


if __name__ == '__main__':
    try:
        main()
    except BaseException:
        sys.stdout.flush()
        sys.stderr.flush()
        raise
"#,
            function = self.function,
            call_dir = GUEST_CALL_DIR,
        )
    }
}

/// The environment script: exports required variables and invokes the driver
/// under the target runtime.
#[derive(Debug, Clone)]
pub struct EnvScript {
    pub env: Vec<EnvVar>,
    pub runtime: String,
    pub driver: String,
}

impl EnvScript {
    pub fn render(&self) -> String {
        let exports = self
            .env
            .iter()
            .map(|var| format!("{}={}", var.name, var.value))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "#!/bin/bash\nset -e\n\n{} {} {}\n",
            exports, self.runtime, self.driver
        )
    }
}

/// The launcher: full container engine invocation with its bind mounts.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub engine: PathBuf,
    pub image: String,
    pub mounts: Vec<MountSpec>,
    pub command: Vec<String>,
}

impl LaunchPlan {
    pub fn render(&self) -> String {
        let mut script = String::from("#!/bin/bash\n\n");
        write!(script, "exec {} run --rm \\\n", self.engine.display()).unwrap();
        for mount in &self.mounts {
            let ro = if mount.readonly { ":ro" } else { "" };
            write!(
                script,
                "    -v '{}:{}{}' \\\n",
                mount.host.display(),
                mount.guest,
                ro
            )
            .unwrap();
        }
        write!(script, "    {} \\\n", self.image).unwrap();
        script.push_str("    ");
        script.push_str(&self.command.join(" "));
        script.push('\n');
        script
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_driver_reexports_fixed_name() {
        let driver = DriverScript {
            function: "bandpass_filter".to_string(),
        };
        let text = driver.render();

        assert!(text.contains("from function_src import bandpass_filter"));
        assert!(text.contains("retval = bandpass_filter(**kwargs)"));
        assert!(text.contains("/run_call/kwargs.json"));
        assert!(text.contains("/run_call/retval.json"));
    }

    #[test]
    fn test_env_script_exports_before_runtime() {
        let script = EnvScript {
            env: vec![
                EnvVar {
                    name: STORE_DIR_ENV.to_string(),
                    value: GUEST_STORE_DIR.to_string(),
                },
                EnvVar {
                    name: "PYTHONPATH".to_string(),
                    value: "/run_call/function_src/_local_modules".to_string(),
                },
            ],
            runtime: "python3".to_string(),
            driver: "/run_call/run.py".to_string(),
        };
        let text = script.render();

        assert!(text.starts_with("#!/bin/bash\nset -e\n"));
        assert!(text.contains(
            "SPEICHER_STORE_DIR=/content-store \
             PYTHONPATH=/run_call/function_src/_local_modules python3 /run_call/run.py"
        ));
    }

    #[test]
    fn test_launch_plan_renders_mounts_in_order() {
        let plan = LaunchPlan {
            engine: PathBuf::from("/usr/bin/docker"),
            image: "acme/sorter:1.2".to_string(),
            mounts: vec![
                MountSpec {
                    host: PathBuf::from("/host/store"),
                    guest: GUEST_STORE_DIR.to_string(),
                    readonly: false,
                },
                MountSpec {
                    host: PathBuf::from("/host/in.dat"),
                    guest: format!("{}/recording.dat", GUEST_INPUTS_DIR),
                    readonly: true,
                },
            ],
            command: vec![
                "bash".to_string(),
                format!("{}/run.sh", GUEST_CALL_DIR),
            ],
        };
        let text = plan.render();

        assert!(text.contains("exec /usr/bin/docker run --rm"));
        let store = text.find("-v '/host/store:/content-store'").unwrap();
        let input = text.find("-v '/host/in.dat:/inputs/recording.dat:ro'").unwrap();
        assert!(store < input);
        assert!(text.trim_end().ends_with("acme/sorter:1.2 \\\n    bash /run_call/run.sh"));
    }
}
