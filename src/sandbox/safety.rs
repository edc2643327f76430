//! Pattern-based payload screening
//!
//! An ordered blocklist over command text and generated source text. This
//! is defense-in-depth against accidental or naive destructive payloads,
//! NOT a security boundary: string concatenation, `eval`, dynamic imports,
//! and encodings beyond the enumerated ones all evade literal matching.
//! Real isolation comes from the container backend. Patterns deliberately
//! match destination paths, not verbs alone, so `rm -rf ~/outputs/tmp`
//! stays allowed while `rm -rf ~` is refused.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::info;

use crate::sandbox::executor::truncate_chars;

/// Verdict produced fresh per request; carries no state
#[derive(Debug, Clone)]
pub struct SafetyVerdict {
    pub allowed: bool,
    /// Refusal reason; empty when allowed
    pub reason: String,
}

impl SafetyVerdict {
    fn allow() -> Self {
        SafetyVerdict {
            allowed: true,
            reason: String::new(),
        }
    }

    fn block(reason: String) -> Self {
        SafetyVerdict {
            allowed: false,
            reason,
        }
    }
}

/// Catastrophic, irreversible command shapes. Always refused.
static BLOCKED_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // rm targeting home, root, or user directories; tolerates short
        // flags (-rf), split flags (-r -f), and GNU long flags
        r"(?i)\brm\s+(-{1,2}[\w-]+\s+)*\s*(/\s*$|~\s*$|~/\s*$|\$HOME)",
        r"(?i)\brm\s+(-{1,2}[\w-]+\s+)*/Users\b",
        r"(?i)\brm\s+(-{1,2}[\w-]+\s+)*/home\b",
        // rm targeting critical home subdirectories
        r"(?i)\brm\s+(-{1,2}[\w-]+\s+)*\s*~/?(Desktop|Documents|Downloads|Pictures|Music|Movies|Library|Applications)\b",
        // Filesystem destruction
        r"(?i)\bmkfs\b",
        r"(?i)\bdd\s+if=",
        r"(?i)>\s*/dev/sd[a-z]",
        // Fork bomb variants
        r"(?i):\(\)\s*\{",
        r"(?i)\bfork\s*bomb\b",
        // System power
        r"(?i)\bshutdown\b",
        r"(?i)\breboot\b",
        r"(?i)\bhalt\b",
        r"(?i)\bpoweroff\b",
        // Privilege escalation
        r"(?i)\bsudo\b",
        // Pipe-to-shell remote code execution
        r"(?i)\bcurl\b.*\|\s*\bsh\b",
        r"(?i)\bcurl\b.*\|\s*\bbash\b",
        r"(?i)\bwget\b.*\|\s*\bsh\b",
        r"(?i)\bwget\b.*\|\s*\bbash\b",
        // Recursive permission destruction
        r"(?i)\bchmod\s+(-[rR]\s+|--recursive\s+)?(777|a\+rwx)\s+[/~]",
        // Interpreter inline code execution (shell-injection bypass)
        r"(?i)\bpython3?\s+-[cE]\s",
        r"(?i)\bperl\s+-[eE]\s",
        r"(?i)\bruby\s+-[eE]\s",
        r"(?i)\bnode\s+-[eE]\s",
        // Destructive find operations
        r"(?i)\bfind\b.*\s-delete\b",
        r"(?i)\bfind\b.*-exec\s+rm\b",
        // Encoding bypass piped to shell
        r"(?i)\bbase64\s.*\|\s*(sh|bash)\b",
        // Home directory relocation
        r"(?i)\bmv\s+(-\w+\s+)*~(\s|$)",
        r"(?i)\bmv\s+(-\w+\s+)*~/(\s|$)",
        // Write/append redirects to critical dotfiles
        r"(?i)>>?\s*~/?\.(ssh|bashrc|bash_profile|zshrc|zprofile|profile|gitconfig|gnupg|npmrc|netrc)",
        // Symlink attacks on critical dotfiles
        r"(?i)\bln\s+.*~/?\.(ssh|bashrc|bash_profile|zshrc|zprofile|profile|gitconfig|gnupg)",
        // printf/echo piped to shell
        r"(?i)\bprintf\b.*\|\s*(sh|bash)\b",
        r"(?i)\becho\b.*\|\s*(sh|bash)\b",
        // eval wrapping command or backtick substitution
        r#"(?i)\beval\b\s+"?\$\("#,
        r#"(?i)\beval\b\s+"?`"#,
        // bash/sh -c with adjacent empty quotes (string splitting obfuscation)
        r#"(?i)\b(bash|sh)\s+-c\s+.*('{2}|"{2})"#,
    ]
    .iter()
    .map(|p| Regex::new(p).expect("invalid blocked pattern"))
    .collect()
});

/// Allowed operations recorded for the audit trail. Never blocking.
static AUDIT_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        (r"(?i)\brm\s", "file deletion"),
        (r"(?i)\bchmod\b|\bchown\b", "permission change"),
        (r"(?i)\bgit\s+push\b", "git push"),
        (r"(?i)\bsystemctl\b|\blaunchctl\b", "service management"),
        (r"(?i)\bcurl\b|\bwget\b", "network download"),
        (r"(?i)\bpip3?\s+install\b.*https?://", "pip install from URL"),
        (r"(?i)\bfind\b", "find command"),
        (r"(?i)\bln\b", "symlink operation"),
        (r"(?i)\bmv\b", "file move"),
        (r"(?i)\bpython3?\s+-c\b", "python inline execution"),
        (r"(?i)\beval\b", "eval command"),
        (r"(?i)\bprintf\b.*\|", "printf pipe"),
    ]
    .iter()
    .map(|(p, label)| (Regex::new(p).expect("invalid audit pattern"), *label))
    .collect()
});

/// Dangerous operations in generated source. Applied only on the
/// subprocess path; the container backend relies on filesystem isolation
/// instead.
static CODE_BLOCKED_PATTERNS: Lazy<Vec<(Regex, &'static str)>> = Lazy::new(|| {
    [
        // Reading SSH keys, GPG keys, credentials
        (
            r#"(?i)['"]~/?\.(ssh|gnupg|aws|kube|docker)/"#,
            "credential directory access",
        ),
        (r#"['"].*\.env['"]"#, ".env file access"),
        (r#"['"].*\.pem['"]"#, "PEM key file access"),
        (r#"['"].*id_rsa['"]"#, "SSH key access"),
        // Direct OS command execution
        (r"(?i)\bos\.system\s*\(", "os.system call"),
        // Recursive delete of home or root
        (
            r#"(?i)shutil\.rmtree\s*\(\s*['"]?(/|~|Path\.home)"#,
            "recursive delete of home/root",
        ),
        // Reverse shells; legitimate HTTP uses requests/httpx, not raw sockets
        (r"(?i)socket\..*connect\s*\(", "outbound socket connection"),
        // Reads of system credential files
        (
            r#"(?i)open\s*\(\s*['"]/etc/(passwd|shadow|sudoers)"#,
            "system file read",
        ),
    ]
    .iter()
    .map(|(p, label)| (Regex::new(p).expect("invalid code pattern"), *label))
    .collect()
});

/// Classify a shell command line.
///
/// Blocks catastrophic shapes; logs audit-worthy but allowed operations.
pub fn classify_command(command: &str) -> SafetyVerdict {
    for pattern in BLOCKED_PATTERNS.iter() {
        if pattern.is_match(command) {
            return SafetyVerdict::block(format!(
                "BLOCKED: Catastrophic command pattern '{}'. Refusing to execute.",
                pattern.as_str()
            ));
        }
    }
    for (pattern, label) in AUDIT_PATTERNS.iter() {
        if pattern.is_match(command) {
            info!("audit: {} detected: {}", label, truncate_chars(command, 200));
        }
    }
    SafetyVerdict::allow()
}

/// Classify generated source text for dangerous operations.
pub fn classify_code(code: &str) -> SafetyVerdict {
    for (pattern, label) in CODE_BLOCKED_PATTERNS.iter() {
        if pattern.is_match(code) {
            return SafetyVerdict::block(format!(
                "BLOCKED: Code contains {}. Refusing to execute in subprocess mode.",
                label
            ));
        }
    }
    SafetyVerdict::allow()
}
