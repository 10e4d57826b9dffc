//! Compiler diagnostics from `go build` output

use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use tentacle_core::BuildError;

/// `file.go:line[:col]: message`
static GO_DIAGNOSTIC: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"^\s*(?P<file>[^\s:][^:]*\.go):(?P<line>\d+)(?::(?P<col>\d+))?:\s*(?P<msg>.+)$").ok()
});

/// Extract structured diagnostics from the build tool's stderr.
///
/// Paths are made relative to `source_root` where possible. Package
/// headers (`# example.com/pkg`) and other noise are skipped.
pub fn parse_go_build_output(output: &str, source_root: &Path) -> Vec<BuildError> {
    let Some(pattern) = GO_DIAGNOSTIC.as_ref() else {
        return Vec::new();
    };

    output
        .lines()
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| pattern.captures(line))
        .filter_map(|caps| {
            let line = caps.name("line")?.as_str().parse().ok()?;
            let column = caps
                .name("col")
                .and_then(|c| c.as_str().parse().ok())
                .unwrap_or(0);
            Some(BuildError {
                file: relative_file(caps.name("file")?.as_str(), source_root),
                line,
                column,
                message: caps.name("msg")?.as_str().trim().to_string(),
            })
        })
        .collect()
}

fn relative_file(file: &str, source_root: &Path) -> String {
    let path = Path::new(file);
    let relative = path.strip_prefix(source_root).unwrap_or(path);
    let relative = relative.strip_prefix("./").unwrap_or(relative);
    relative.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_typical_failure() {
        let output = "\
# example.com/plugin
./main.go:12:5: undefined: registerResource
./pkg/client.go:40:2: imported and not used: \"fmt\"
internal/exec.go:7: syntax error: unexpected newline
note: module requires Go 1.22
";
        let errors = parse_go_build_output(output, Path::new("/src/plugin"));
        assert_eq!(errors.len(), 3);
        assert_eq!(
            errors[0],
            BuildError {
                file: "main.go".to_string(),
                line: 12,
                column: 5,
                message: "undefined: registerResource".to_string(),
            }
        );
        assert_eq!(errors[1].file, "pkg/client.go");
        assert_eq!(errors[2].column, 0);
        assert_eq!(errors[2].to_string(), "internal/exec.go:7: syntax error: unexpected newline");
    }

    #[test]
    fn test_absolute_paths_relative_to_root() {
        let output = "/src/plugin/cmd/main.go:3:1: expected declaration";
        let errors = parse_go_build_output(output, Path::new("/src/plugin"));
        assert_eq!(errors[0].file, "cmd/main.go");
    }

    #[test]
    fn test_no_diagnostics() {
        assert!(parse_go_build_output("go: downloading example.com/x v1.0.0\n", Path::new(".")).is_empty());
        assert!(parse_go_build_output("", Path::new(".")).is_empty());
    }
}
