//! Git URL handling: scp-style and ssh:// clone URLs, the internal-host
//! rewrite for in-cluster jobs, and the canonical form the webhook intake
//! matches repositories by.

use url::Url;

#[inline]
pub fn is_ssh_url(url: &str) -> bool {
    url.starts_with("git@") || url.starts_with("ssh://")
}

/// Host and explicit port of a clone URL. scp-style URLs never carry a port.
pub fn extract_host_and_port(git_url: &str) -> (Option<String>, Option<u16>) {
    if let Some(rest) = git_url.strip_prefix("git@") {
        let host = rest.split(':').next().unwrap_or(rest);
        return (Some(host.to_string()), None);
    }
    if git_url.contains("://") {
        if let Ok(parsed) = Url::parse(git_url) {
            return (parsed.host_str().map(str::to_string), parsed.port());
        }
    }
    (None, None)
}

/// Rewrite an SSH clone URL whose host is the public git endpoint onto the
/// cluster-internal one. Anything else passes through untouched.
pub fn rewrite_internal_host(
    git_url: &str,
    internal_host: Option<&str>,
    internal_port: Option<u16>,
    external_host: Option<&str>,
) -> String {
    let (Some(internal_host), Some(external_host)) = (internal_host, external_host) else {
        return git_url.to_string();
    };

    if let Some(rest) = git_url.strip_prefix("git@") {
        if let Some((host, path)) = rest.split_once(':') {
            if host == external_host && !path.is_empty() {
                let port = internal_port.unwrap_or(22);
                return format!("ssh://git@{internal_host}:{port}/{path}");
            }
        }
        return git_url.to_string();
    }

    if git_url.starts_with("ssh://") {
        if let Ok(parsed) = Url::parse(git_url) {
            if parsed.host_str() == Some(external_host) {
                let user = match parsed.username() {
                    "" => "git",
                    user => user,
                };
                let port = internal_port.or(parsed.port()).unwrap_or(22);
                let path = parsed.path().trim_start_matches('/');
                return format!("ssh://{user}@{internal_host}:{port}/{path}");
            }
        }
    }

    git_url.to_string()
}

/// Canonical `{host}/{owner}/{repo}` form, lowercased, `.git` stripped.
/// All URL styles of the same repository normalize to the same value.
pub fn normalize_repo_url(repo_url: &str) -> Option<String> {
    let trimmed = repo_url.trim();
    if trimmed.is_empty() {
        return None;
    }

    let (host, path) = if let Some(rest) = trimmed.strip_prefix("git@") {
        match rest.split_once(':') {
            Some((host, path)) => (host.to_string(), path.to_string()),
            None => (rest.to_string(), String::new()),
        }
    } else if trimmed.contains("://") {
        let parsed = Url::parse(trimmed).ok()?;
        (
            parsed.host_str().unwrap_or_default().to_string(),
            parsed.path().trim_start_matches('/').to_string(),
        )
    } else {
        match trimmed.split_once('/') {
            Some((host, path)) => (host.to_string(), path.to_string()),
            None => (trimmed.to_string(), String::new()),
        }
    };

    if host.is_empty() || path.is_empty() {
        return None;
    }
    let path = path.strip_suffix(".git").unwrap_or(&path);
    Some(format!("{host}/{path}").to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_ssh_url() {
        assert!(is_ssh_url("git@git.example:user/repo.git"));
        assert!(is_ssh_url("ssh://git@git.example:2222/user/repo.git"));
        assert!(!is_ssh_url("https://git.example/user/repo.git"));
    }

    #[test]
    fn test_extract_host_and_port() {
        assert_eq!(
            extract_host_and_port("git@git.example:user/repo.git"),
            (Some("git.example".to_string()), None)
        );
        assert_eq!(
            extract_host_and_port("ssh://git@git.internal:2222/user/repo.git"),
            (Some("git.internal".to_string()), Some(2222))
        );
        assert_eq!(
            extract_host_and_port("https://git.example/user/repo.git"),
            (Some("git.example".to_string()), None)
        );
        assert_eq!(extract_host_and_port("not a url"), (None, None));
    }

    #[test]
    fn test_rewrite_scp_style_url() {
        let rewritten = rewrite_internal_host(
            "git@git.example:user/repo.git",
            Some("gitea-ssh.hydrosim.svc"),
            Some(2222),
            Some("git.example"),
        );
        assert_eq!(rewritten, "ssh://git@gitea-ssh.hydrosim.svc:2222/user/repo.git");
    }

    #[test]
    fn test_rewrite_ssh_url_defaults_port() {
        let rewritten = rewrite_internal_host(
            "ssh://git@git.example/user/repo.git",
            Some("gitea-ssh.hydrosim.svc"),
            None,
            Some("git.example"),
        );
        assert_eq!(rewritten, "ssh://git@gitea-ssh.hydrosim.svc:22/user/repo.git");
    }

    #[test]
    fn test_rewrite_leaves_other_hosts_alone() {
        let url = "git@github.com:user/repo.git";
        assert_eq!(
            rewrite_internal_host(url, Some("gitea-ssh"), Some(2222), Some("git.example")),
            url
        );
        let https = "https://git.example/user/repo.git";
        assert_eq!(
            rewrite_internal_host(https, Some("gitea-ssh"), Some(2222), Some("git.example")),
            https
        );
    }

    #[test]
    fn test_rewrite_without_configuration_is_identity() {
        let url = "git@git.example:user/repo.git";
        assert_eq!(rewrite_internal_host(url, None, None, Some("git.example")), url);
        assert_eq!(rewrite_internal_host(url, Some("internal"), None, None), url);
    }

    #[test]
    fn test_normalize_repo_url_forms_agree() {
        let expected = Some("git.example/user/repo".to_string());
        assert_eq!(normalize_repo_url("git@git.example:User/Repo.git"), expected);
        assert_eq!(normalize_repo_url("ssh://git@git.example/user/repo.git"), expected);
        assert_eq!(normalize_repo_url("https://git.example/user/repo"), expected);
        assert_eq!(normalize_repo_url("git.example/user/repo.git"), expected);
    }

    #[test]
    fn test_normalize_repo_url_rejects_incomplete() {
        assert_eq!(normalize_repo_url(""), None);
        assert_eq!(normalize_repo_url("git@git.example"), None);
        assert_eq!(normalize_repo_url("justahost"), None);
    }
}
