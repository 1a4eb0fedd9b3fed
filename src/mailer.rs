use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub file_name: String,
    pub path: String,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutboundEmail {
    pub to: String,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<Attachment>,
}

/// Outbound mail seam. The daemon never speaks SMTP itself; the host's
/// mailer drains whatever the transport produces.
pub trait MailTransport {
    fn send(&self, mail: &OutboundEmail) -> anyhow::Result<()>;
}

/// Serializes each outbound message as one JSON file under the workspace
/// `outbox/` directory. Attachment files are re-read and their digests
/// verified at send time so a swapped file fails the send instead of going
/// out silently altered.
pub struct SpoolTransport {
    outbox: PathBuf,
}

impl SpoolTransport {
    pub fn new(workspace: &Path) -> SpoolTransport {
        SpoolTransport {
            outbox: workspace.join("outbox"),
        }
    }
}

impl MailTransport for SpoolTransport {
    fn send(&self, mail: &OutboundEmail) -> anyhow::Result<()> {
        for att in &mail.attachments {
            let actual = file_sha256(Path::new(&att.path))?;
            if actual != att.sha256 {
                anyhow::bail!(
                    "attachment {} changed on disk since it was recorded",
                    att.file_name
                );
            }
        }
        std::fs::create_dir_all(&self.outbox)?;
        let path = self.outbox.join(format!("{}.json", Uuid::new_v4()));
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(mail)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

pub fn file_sha256(path: &Path) -> anyhow::Result<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

/// Lenient shape check for manually entered addresses; real deliverability
/// is the host mailer's problem.
pub fn is_valid_email(s: &str) -> bool {
    let s = s.trim();
    if s.is_empty() || s.chars().any(|c| c.is_whitespace()) {
        return false;
    }
    let mut parts = s.splitn(2, '@');
    let local = parts.next().unwrap_or("");
    let Some(domain) = parts.next() else {
        return false;
    };
    !local.is_empty()
        && !domain.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !domain.contains('@')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_shape_check() {
        assert!(is_valid_email("ada@school.test"));
        assert!(is_valid_email(" ada.obi@portal.example.ng "));
        assert!(!is_valid_email(""));
        assert!(!is_valid_email("ada"));
        assert!(!is_valid_email("ada@"));
        assert!(!is_valid_email("@school.test"));
        assert!(!is_valid_email("ada@school"));
        assert!(!is_valid_email("ada@.test"));
        assert!(!is_valid_email("a da@school.test"));
    }

    #[test]
    fn spool_writes_one_file_per_mail() {
        let dir = std::env::temp_dir().join(format!("schoolcomm-spool-{}", Uuid::new_v4()));
        let transport = SpoolTransport::new(&dir);
        let mail = OutboundEmail {
            to: "ada@school.test".into(),
            subject: "Term resumption".into(),
            body: "School resumes Monday.".into(),
            attachments: vec![],
        };
        transport.send(&mail).expect("send");
        transport.send(&mail).expect("send again");
        let count = std::fs::read_dir(dir.join("outbox")).expect("outbox").count();
        assert_eq!(count, 2);
    }

    #[test]
    fn spool_rejects_tampered_attachment() {
        let dir = std::env::temp_dir().join(format!("schoolcomm-att-{}", Uuid::new_v4()));
        std::fs::create_dir_all(&dir).expect("mkdir");
        let file = dir.join("timetable.pdf");
        std::fs::write(&file, b"v1").expect("write");
        let sha = file_sha256(&file).expect("sha");
        std::fs::write(&file, b"v2").expect("rewrite");

        let transport = SpoolTransport::new(&dir);
        let mail = OutboundEmail {
            to: "ada@school.test".into(),
            subject: "Timetable".into(),
            body: "Attached.".into(),
            attachments: vec![Attachment {
                file_name: "timetable.pdf".into(),
                path: file.to_string_lossy().to_string(),
                sha256: sha,
            }],
        };
        assert!(transport.send(&mail).is_err());
    }
}
