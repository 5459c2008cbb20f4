//! Heuristic for test commands that would recursively launch the host editor.
//!
//! Detection only ever produces a warning; it never skips execution on its own.

/// Substrings that identify an editor launcher script or editor test package.
pub const LAUNCHER_PATTERNS: &[&str] = &[
    "out/test/runTest.js",
    "runTest.js",
    "@vscode/test-electron",
    "@vscode/test-cli",
    "vscode-test",
];

/// Package-manager invocations that simply run the manifest's `test` script.
pub const CANONICAL_TEST_SCRIPT_COMMANDS: &[&str] = &[
    "npm test",
    "npm run test",
    "npm t",
    "pnpm test",
    "pnpm run test",
    "yarn test",
    "yarn run test",
    "bun run test",
];

/// True when `command` would likely start another instance of the host editor.
///
/// `manifest_test_script` is the project manifest's test script, when readable.
/// It is only consulted for canonical "run the test script" commands.
pub fn looks_like_recursive_launch(command: &str, manifest_test_script: Option<&str>) -> bool {
    if mentions_launcher(command) {
        return true;
    }
    let normalized = normalize_whitespace(command);
    if !CANONICAL_TEST_SCRIPT_COMMANDS.contains(&normalized.as_str()) {
        return false;
    }
    manifest_test_script.is_some_and(mentions_launcher)
}

fn mentions_launcher(text: &str) -> bool {
    let text = text.replace('\\', "/");
    LAUNCHER_PATTERNS.iter().any(|p| text.contains(p))
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
