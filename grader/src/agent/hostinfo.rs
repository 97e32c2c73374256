use grader_core::compiler::Language;
use uuid::Uuid;

/// Stable executor id for a host: the same hostname always yields the same id.
pub fn default_executor_uuid(hostname: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, hostname.as_bytes())
}

pub fn hostname() -> String {
    whoami::fallible::hostname().unwrap_or_else(|e| {
        log::warn!("Failed to read hostname: {}", e);
        "localhost".to_string()
    })
}

/// What the server learns about this executor when it registers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    pub uuid: Uuid,
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub cpus: usize,
    pub languages: Vec<Language>,
}

impl HostInfo {
    pub fn collect(uuid: Uuid, hostname: String, languages: Vec<Language>) -> Self {
        Self {
            uuid,
            hostname,
            os: whoami::distro(),
            arch: whoami::arch().to_string(),
            cpus: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            languages,
        }
    }
}
