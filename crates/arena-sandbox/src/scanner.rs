//! Static policy scanner for bot sources.
//!
//! This is **defense-in-depth**: the V8 isolate and the allow-list realm built
//! by the prelude are the real boundary. The scanner rejects obvious escape
//! attempts before any isolate resources are spent and gives the bot author a
//! readable reason. Matches inside comments and string literals still deny;
//! that false-positive rate is accepted.

use crate::error::SandboxError;

/// Default maximum source size in bytes (256 KB).
pub const DEFAULT_MAX_SOURCE_SIZE: usize = 256 * 1024;

/// Identifiers that are denied wherever they appear as a whole token.
const DENIED_IDENTIFIERS: &[&str] = &[
    // dynamic code loading
    "eval",
    "Function",
    "import",
    "WebAssembly",
    // module and process access
    "require",
    "module",
    "exports",
    "process",
    "child_process",
    "Deno",
    "Bun",
    "__dirname",
    "__filename",
    // filesystem
    "readFile",
    "readFileSync",
    "writeFile",
    "writeFileSync",
    "unlinkSync",
    "readdirSync",
    "execSync",
    "spawnSync",
    // raw memory and foreign calls
    "Buffer",
    "SharedArrayBuffer",
    "Atomics",
    "ffi",
    "dlopen",
];

/// Character sequences that are denied even when they are not standalone
/// identifiers.
const DENIED_PATTERNS: &[&str] = &[
    "__proto__",
    "constructor.constructor",
    "constructor[",
    "globalThis[",
    "Reflect.",
    "String.fromCharCode",
];

/// Outcome of scanning a bot source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The source may be loaded.
    Allow,
    /// The source is rejected.
    Deny {
        /// The token or pattern that matched.
        token: String,
    },
}

impl Verdict {
    /// Whether the source was allowed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Scan raw source text against the denylist.
pub fn scan(source: &str) -> Verdict {
    for pattern in DENIED_PATTERNS {
        if source.contains(pattern) {
            return Verdict::Deny {
                token: (*pattern).to_string(),
            };
        }
    }

    for token in identifiers(source) {
        if let Some(denied) = DENIED_IDENTIFIERS.iter().find(|d| **d == token) {
            return Verdict::Deny {
                token: (*denied).to_string(),
            };
        }
    }

    Verdict::Allow
}

/// Admission check: size, emptiness, then the denylist.
pub fn admit(source: &str, max_size: Option<usize>) -> Result<(), SandboxError> {
    let max = max_size.unwrap_or(DEFAULT_MAX_SOURCE_SIZE);

    if source.len() > max {
        return Err(SandboxError::SourceTooLarge {
            max,
            actual: source.len(),
        });
    }

    if source.trim().is_empty() {
        return Err(SandboxError::InvalidSource {
            reason: "source is empty".into(),
        });
    }

    match scan(source) {
        Verdict::Allow => Ok(()),
        Verdict::Deny { token } => Err(SandboxError::PolicyDenied { token }),
    }
}

/// Split source text into JavaScript identifier-like tokens.
fn identifiers(source: &str) -> impl Iterator<Item = &str> {
    source
        .split(|c: char| !(c.is_alphanumeric() || c == '_' || c == '$'))
        .filter(|t| !t.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn denied(source: &str) -> String {
        match scan(source) {
            Verdict::Deny { token } => token,
            Verdict::Allow => panic!("expected deny for: {source}"),
        }
    }

    #[test]
    fn allows_ordinary_bot() {
        let source = r#"
            const ws = connect(bot.endpoint);
            ws.on("open", () => ws.send(JSON.stringify({ type: "join", id: bot.id })));
            ws.on("message", (raw) => {
                const msg = JSON.parse(raw);
                if (msg.type === "tick") ws.send(JSON.stringify({ type: "move", dir: "left" }));
            });
            setInterval(() => console.log("alive"), 1000);
        "#;
        assert_eq!(scan(source), Verdict::Allow);
        assert!(admit(source, None).is_ok());
    }

    #[test]
    fn denies_filesystem_access() {
        assert_eq!(denied(r#"const fs = require("fs");"#), "require");
        assert_eq!(denied("fs.readFileSync('/etc/passwd')"), "readFileSync");
    }

    #[test]
    fn denies_process_and_module_access() {
        assert_eq!(denied("process.exit(1)"), "process");
        assert_eq!(denied("module.exports = {}"), "module");
        assert_eq!(denied("console.log(__dirname)"), "__dirname");
    }

    #[test]
    fn denies_dynamic_code() {
        assert_eq!(denied(r#"eval("1+1")"#), "eval");
        assert_eq!(denied(r#"new Function("return this")"#), "Function");
        assert_eq!(denied(r#"import("fs")"#), "import");
    }

    #[test]
    fn denies_escape_patterns() {
        assert_eq!(denied("({}).__proto__.x = 1"), "__proto__");
        assert_eq!(
            denied(r#""".constructor.constructor("x")()"#),
            "constructor.constructor"
        );
        assert_eq!(denied(r#"globalThis["ev" + "al"]"#), "globalThis[");
    }

    #[test]
    fn matches_whole_tokens_only() {
        // "processed" and "evaluate" contain denied words but are different tokens
        let source = "const processed = evaluate(board); const importance = 3;";
        assert_eq!(scan(source), Verdict::Allow);
    }

    #[test]
    fn tokens_in_comments_still_deny() {
        assert_eq!(denied("// never call require here\nconsole.log(1);"), "require");
    }

    #[test]
    fn rejects_empty_source() {
        assert!(matches!(
            admit("   \n", None),
            Err(SandboxError::InvalidSource { .. })
        ));
    }

    #[test]
    fn rejects_oversized_source() {
        let big = "x".repeat(DEFAULT_MAX_SOURCE_SIZE + 1);
        assert!(matches!(
            admit(&big, None),
            Err(SandboxError::SourceTooLarge { .. })
        ));
        assert!(admit(&"x".repeat(100), Some(200)).is_ok());
        assert!(admit(&"x".repeat(100), Some(50)).is_err());
    }

    #[test]
    fn admit_maps_deny_to_policy_error() {
        let err = admit("Deno.exit()", None).unwrap_err();
        assert!(matches!(err, SandboxError::PolicyDenied { ref token } if token == "Deno"));
    }
}
