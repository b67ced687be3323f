//! Runtime profiles: how each supported language is built and run.
//!
//! Adding a language means adding a row to [`PROFILES`].

/// Exit status the compile step reports when compilation fails.
pub const COMPILE_FAILED_EXIT: i64 = 242;

/// Placeholder substituted with the staged source path inside the container.
const FILE_PLACEHOLDER: &str = "{file}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeProfile {
    pub extension: &'static str,
    pub image: &'static str,
    /// Name the source is staged under inside the workspace.
    pub source_name: &'static str,
    pub compile: Option<&'static str>,
    pub run: &'static str,
}

pub static PROFILES: &[RuntimeProfile] = &[
    RuntimeProfile {
        extension: "js",
        image: "node:20-alpine",
        source_name: "main.js",
        compile: None,
        run: "node {file}",
    },
    RuntimeProfile {
        extension: "py",
        image: "python:3.12-alpine",
        source_name: "main.py",
        compile: None,
        run: "python3 -u {file}",
    },
    RuntimeProfile {
        extension: "c",
        image: "gcc:13",
        source_name: "main.c",
        compile: Some("gcc {file} -o /tmp/main"),
        run: "/tmp/main",
    },
    RuntimeProfile {
        extension: "cpp",
        image: "gcc:13",
        source_name: "main.cpp",
        compile: Some("g++ {file} -o /tmp/main"),
        run: "/tmp/main",
    },
    RuntimeProfile {
        extension: "java",
        image: "eclipse-temurin:21-jdk-alpine",
        source_name: "Main.java",
        compile: Some("javac -d /tmp {file}"),
        run: "java -cp /tmp Main",
    },
];

/// Look up the profile for a file extension (case-insensitive).
pub fn resolve(extension: &str) -> Option<&'static RuntimeProfile> {
    PROFILES
        .iter()
        .find(|p| p.extension.eq_ignore_ascii_case(extension))
}

/// Extension of `filename`, if it has a non-empty one.
pub fn extension_of(filename: &str) -> Option<&str> {
    let name = filename.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(filename);
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Some(ext),
        _ => None,
    }
}

impl RuntimeProfile {
    pub fn requires_compile_step(&self) -> bool {
        self.compile.is_some()
    }

    /// Render the shell command run inside the container for a staged file.
    ///
    /// A failing compile step prints `marker` on its own line to stderr and
    /// exits with [`COMPILE_FAILED_EXIT`]. The marker is only in the outer
    /// shell's command line, which the program replaces via `exec`, so the
    /// program cannot forge a compile failure.
    pub fn command(&self, staged_path: &str, marker: &str) -> String {
        let quoted = shell_quote(staged_path);
        let run = self.run.replace(FILE_PLACEHOLDER, &quoted);
        match self.compile {
            Some(compile) => format!(
                "{} || {{ echo {} >&2; exit {}; }}; exec {}",
                compile.replace(FILE_PLACEHOLDER, &quoted),
                shell_quote(marker),
                COMPILE_FAILED_EXIT,
                run
            ),
            None => format!("exec {}", run),
        }
    }

    /// If `output` comes from a failed compile step, return the compiler
    /// diagnostics with the marker line removed.
    pub fn compile_failure<'a>(
        &self,
        exit_code: i64,
        output: &'a [u8],
        marker: &str,
    ) -> Option<&'a [u8]> {
        if !self.requires_compile_step() || exit_code != COMPILE_FAILED_EXIT || marker.is_empty() {
            return None;
        }
        let trimmed = trim_ascii_end(output);
        trimmed.strip_suffix(marker.as_bytes())
    }
}

fn trim_ascii_end(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(0, |i| i + 1);
    &bytes[..end]
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_every_reference_language() {
        for ext in ["js", "py", "c", "cpp", "java"] {
            assert_eq!(resolve(ext).map(|p| p.extension), Some(ext));
        }
        assert!(resolve("JS").is_some());
    }

    #[test]
    fn unknown_extension_is_not_supported() {
        assert!(resolve("rb").is_none());
        assert!(resolve("").is_none());
    }

    #[test]
    fn compiled_languages_chain_compile_then_run() {
        let c = resolve("c").unwrap();
        assert!(c.requires_compile_step());
        assert_eq!(
            c.command("/sandbox/main.c", "m4rk"),
            "gcc '/sandbox/main.c' -o /tmp/main || { echo 'm4rk' >&2; exit 242; }; exec /tmp/main"
        );

        let java = resolve("java").unwrap();
        assert_eq!(java.source_name, "Main.java");
        assert!(java
            .command("/sandbox/Main.java", "m4rk")
            .ends_with("exec java -cp /tmp Main"));
    }

    #[test]
    fn interpreted_languages_run_directly() {
        let py = resolve("py").unwrap();
        assert!(!py.requires_compile_step());
        assert_eq!(
            py.command("/sandbox/main.py", "m4rk"),
            "exec python3 -u '/sandbox/main.py'"
        );
    }

    #[test]
    fn compile_failure_needs_status_and_marker() {
        let c = resolve("c").unwrap();
        let failed = b"main.c:1: error: expected ';'\nm4rk\n";

        assert_eq!(
            c.compile_failure(COMPILE_FAILED_EXIT, failed, "m4rk"),
            Some(&b"main.c:1: error: expected ';'\n"[..])
        );
        // The program itself exiting 242 carries no marker.
        assert_eq!(c.compile_failure(COMPILE_FAILED_EXIT, b"partial result", "m4rk"), None);
        assert_eq!(c.compile_failure(1, failed, "m4rk"), None);

        let py = resolve("py").unwrap();
        assert_eq!(py.compile_failure(COMPILE_FAILED_EXIT, failed, "m4rk"), None);
    }

    #[test]
    fn extension_parsing() {
        assert_eq!(extension_of("a.js"), Some("js"));
        assert_eq!(extension_of("dir/prog.tar.cpp"), Some("cpp"));
        assert_eq!(extension_of("Makefile"), None);
        assert_eq!(extension_of("trailing."), None);
        assert_eq!(extension_of(".bashrc"), None);
    }
}
