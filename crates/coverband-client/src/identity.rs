use once_cell::sync::OnceCell;

/// Who is reporting. Built once per process; the pid is bound on the first
/// report rather than at construction so a forking host does not tag child
/// reports with the parent's pid.
#[derive(Debug)]
pub struct ClientIdentity {
    process_type: String,
    hostname: String,
    pid: OnceCell<u32>,
}

impl ClientIdentity {
    pub fn new(process_type: impl Into<String>) -> Self {
        Self::with_hostname(process_type, local_hostname())
    }

    pub fn with_hostname(process_type: impl Into<String>, hostname: impl AsRef<str>) -> Self {
        Self {
            process_type: process_type.into(),
            hostname: sanitize_hostname(hostname.as_ref()),
            pid: OnceCell::new(),
        }
    }

    pub fn process_type(&self) -> &str {
        &self.process_type
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// Binds the pid if it has not been bound yet and returns it.
    pub fn bind_pid(&self) -> u32 {
        *self.pid.get_or_init(std::process::id)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid.get().copied()
    }
}

/// Strips replacement characters left over from lossy decoding, NULs, quote
/// characters and surrounding whitespace.
pub fn sanitize_hostname(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, '\u{FFFD}' | '\0' | '"' | '\'' | '`'))
        .collect::<String>()
        .trim()
        .to_string()
}

fn local_hostname() -> String {
    system_hostname()
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(unix)]
fn system_hostname() -> Option<String> {
    let mut buf = [0u8; 256];
    let rc = unsafe { libc::gethostname(buf.as_mut_ptr() as *mut libc::c_char, buf.len()) };
    if rc != 0 {
        return None;
    }
    let len = buf.iter().position(|b| *b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..len]).into_owned();
    if name.trim().is_empty() {
        None
    } else {
        Some(name)
    }
}

#[cfg(not(unix))]
fn system_hostname() -> Option<String> {
    std::env::var("COMPUTERNAME").ok()
}
