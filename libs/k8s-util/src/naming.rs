use sha1::{Digest, Sha1};

pub const MAX_LABEL_LENGTH: usize = 63;

/// Fold arbitrary user input into a valid RFC 1123 DNS label.
///
/// Lowercases, squeezes every run of characters outside `[a-z0-9-]` into a
/// single dash and trims dashes at both ends. Results longer than 63
/// characters keep their prefix and gain a 6-hex digest of the lowered input
/// so distinct codes never collapse onto the same label. The function is
/// idempotent: feeding its output back in returns the same label.
pub fn normalize_dns_label(value: &str) -> String {
    normalize_with_max(value, MAX_LABEL_LENGTH)
}

fn normalize_with_max(value: &str, max_length: usize) -> String {
    let lowered = value.trim().to_lowercase();
    let mut normalized = String::with_capacity(lowered.len());
    let mut last_dash = true;
    for c in lowered.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            normalized.push(c);
            last_dash = false;
        } else if !last_dash {
            normalized.push('-');
            last_dash = true;
        }
    }
    while normalized.ends_with('-') {
        normalized.pop();
    }
    if normalized.is_empty() {
        return "student".to_string();
    }
    if normalized.len() > max_length {
        let digest = Sha1::digest(lowered.as_bytes());
        let mut head: String = normalized.chars().take(max_length - 7).collect();
        while head.ends_with('-') {
            head.pop();
        }
        normalized = format!(
            "{head}-{:02x}{:02x}{:02x}",
            digest[0], digest[1], digest[2]
        );
    }
    normalized
}

/// Name shared by the Deployment, Service and Ingress of one student.
#[inline]
pub fn student_resource_name(student_code: &str) -> String {
    format!("student-{}", normalize_dns_label(student_code))
}

/// Host portion of the student's public domain.
#[inline]
pub fn student_dns_label(student_code: &str) -> String {
    normalize_dns_label(student_code)
}
