use portal_k8s_util::naming::student_dns_label;
use portal_store::model::{ProjectClass, Registry, SystemSetting};

/// Rendered host pieces for one student: the workload's Ingress host is
/// `{host_prefix}{label}.{domain_suffix}` and `full_domain` is exactly that.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DomainParts {
    pub host_prefix: String,
    pub domain_suffix: String,
    pub full_domain: String,
}

pub fn student_domain_parts(
    setting: &SystemSetting,
    student_code: &str,
    class: ProjectClass,
) -> DomainParts {
    let host_prefix = setting.domain_prefix().to_lowercase();
    let base = setting.domain_base().trim().trim_start_matches('.');
    let domain_suffix = format!("{}.{base}", class.as_str());
    let full_domain = format!(
        "{host_prefix}{}.{domain_suffix}",
        student_dns_label(student_code)
    );
    DomainParts {
        host_prefix,
        domain_suffix,
        full_domain,
    }
}

/// Registry host as it appears in image references and dockerconfig auth
/// keys: scheme and anything after the authority are dropped.
pub fn normalize_registry_host(url: &str) -> String {
    let trimmed = url.trim();
    match trimmed.split_once("://") {
        Some((_, rest)) => rest.split('/').next().unwrap_or_default().to_string(),
        None => trimmed.trim_end_matches('/').to_string(),
    }
}

/// Render the image repository template. `{{registry}}` demands a configured
/// registry with a usable host; `{{student_code}}` substitutes the raw code.
pub fn render_image_repo(
    template: &str,
    registry: Option<&Registry>,
    student_code: &str,
) -> Option<String> {
    if template.is_empty() {
        return None;
    }
    let mut result = template.to_string();
    if result.contains("{{registry}}") {
        let host = registry
            .map(|r| normalize_registry_host(&r.url))
            .filter(|host| !host.is_empty())?;
        result = result.replace("{{registry}}", &host);
    }
    Some(result.replace("{{student_code}}", student_code))
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;

    fn setting() -> SystemSetting {
        SystemSetting {
            id: 1,
            student_domain_prefix: Some("stu-".to_string()),
            student_domain_base: Some("hydrosim.cn".to_string()),
            build_namespace: Some("hydrosim".to_string()),
            default_registry_id: None,
            default_image_repo_template: Some(
                "{{registry}}/hydrosim/{{student_code}}".to_string(),
            ),
        }
    }

    fn registry(url: &str) -> Registry {
        Registry {
            id: 1,
            name: "main".to_string(),
            url: url.to_string(),
            username: Some("robot".to_string()),
            password: Some("hunter2".to_string()),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_student_domain_parts() {
        let parts = student_domain_parts(&setting(), "A1", ProjectClass::Gd);
        assert_eq!(parts.host_prefix, "stu-");
        assert_eq!(parts.domain_suffix, "gd.hydrosim.cn");
        assert_eq!(parts.full_domain, "stu-a1.gd.hydrosim.cn");
    }

    #[test]
    fn test_domain_base_leading_dot_is_stripped() {
        let mut s = setting();
        s.student_domain_base = Some(".hydrosim.cn".to_string());
        let parts = student_domain_parts(&s, "A1", ProjectClass::Cd);
        assert_eq!(parts.full_domain, "stu-a1.cd.hydrosim.cn");
    }

    #[test]
    fn test_normalize_registry_host() {
        assert_eq!(normalize_registry_host("reg.example"), "reg.example");
        assert_eq!(normalize_registry_host("reg.example/"), "reg.example");
        assert_eq!(normalize_registry_host("https://reg.example/"), "reg.example");
        assert_eq!(normalize_registry_host("http://reg.example:5000"), "reg.example:5000");
    }

    #[test]
    fn test_render_is_scheme_insensitive() {
        let template = "{{registry}}/hydrosim/{{student_code}}";
        let with_scheme = render_image_repo(template, Some(&registry("https://reg.example/")), "a1");
        let host_only = render_image_repo(template, Some(&registry("reg.example")), "a1");
        assert_eq!(with_scheme, host_only);
        assert_eq!(with_scheme.unwrap(), "reg.example/hydrosim/a1");
    }

    #[test]
    fn test_render_without_registry() {
        let template = "{{registry}}/hydrosim/{{student_code}}";
        assert_eq!(render_image_repo(template, None, "a1"), None);
        assert_eq!(
            render_image_repo("harbor.local/x/{{student_code}}", None, "a1").unwrap(),
            "harbor.local/x/a1"
        );
        assert_eq!(render_image_repo("", None, "a1"), None);
    }
}
