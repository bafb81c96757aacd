use crate::error::{Error, Result};

use portal_store::model::Student;

/// Authenticated caller, as handed over by the HTTP layer. Authorization is
/// a pure function of the actor and the target student, so every rule is
/// checkable without a database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Actor {
    Admin,
    Teacher { id: i64 },
    Student { id: i64, code: String },
    /// Signed single-purpose token; may trigger deploys and nothing else.
    DeployToken,
}

impl Actor {
    pub fn can_view(&self, student: &Student) -> bool {
        match self {
            Actor::Admin => true,
            Actor::Teacher { id } => student.teacher_id == Some(*id),
            Actor::Student { id, .. } => student.id == *id,
            Actor::DeployToken => false,
        }
    }

    pub fn can_deploy(&self, student: &Student) -> bool {
        match self {
            Actor::DeployToken => true,
            other => other.can_view(student),
        }
    }

    pub fn can_delete(&self, student: &Student) -> bool {
        match self {
            Actor::DeployToken => false,
            other => other.can_view(student),
        }
    }

    /// Deploy-key issuance: the owning student may ask for a key lazily, but
    /// replacing an existing pair (`force`) needs teacher or admin privilege.
    pub fn can_generate_deploy_key(&self, student: &Student, force: bool) -> bool {
        match self {
            Actor::Admin => true,
            Actor::Teacher { id } => student.teacher_id == Some(*id),
            Actor::Student { id, .. } => student.id == *id && !force,
            Actor::DeployToken => false,
        }
    }

    pub fn can_list_all(&self) -> bool {
        matches!(self, Actor::Admin | Actor::Teacher { .. })
    }
}

pub fn ensure_can_view(actor: &Actor, student: &Student) -> Result<()> {
    ensure(actor.can_view(student), "view", student)
}

pub fn ensure_can_deploy(actor: &Actor, student: &Student) -> Result<()> {
    ensure(actor.can_deploy(student), "deploy", student)
}

pub fn ensure_can_delete(actor: &Actor, student: &Student) -> Result<()> {
    ensure(actor.can_delete(student), "delete", student)
}

pub fn ensure_can_generate_deploy_key(actor: &Actor, student: &Student, force: bool) -> Result<()> {
    let action = if force {
        "rotate the deploy key of"
    } else {
        "generate a deploy key for"
    };
    ensure(actor.can_generate_deploy_key(student, force), action, student)
}

fn ensure(allowed: bool, action: &str, student: &Student) -> Result<()> {
    if allowed {
        Ok(())
    } else {
        Err(Error::Forbidden(format!(
            "actor may not {action} student {}",
            student.student_code
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use chrono::Utc;
    use portal_store::model::ProjectClass;

    fn student(id: i64, teacher_id: Option<i64>) -> Student {
        Student {
            id,
            student_code: format!("s{id}"),
            name: "Student".to_string(),
            project_class: ProjectClass::Gd,
            teacher_id,
            git_repo_url: None,
            expected_image: None,
            domain: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_admin_is_unrestricted() {
        let s = student(1, None);
        assert!(Actor::Admin.can_view(&s));
        assert!(Actor::Admin.can_deploy(&s));
        assert!(Actor::Admin.can_delete(&s));
        assert!(Actor::Admin.can_generate_deploy_key(&s, true));
    }

    #[test]
    fn test_teacher_restricted_to_owned_students() {
        let owned = student(1, Some(7));
        let other = student(2, Some(8));
        let teacher = Actor::Teacher { id: 7 };
        assert!(teacher.can_deploy(&owned));
        assert!(teacher.can_generate_deploy_key(&owned, true));
        assert!(!teacher.can_deploy(&other));
        assert!(!teacher.can_generate_deploy_key(&other, false));
        assert!(!teacher.can_view(&other));
    }

    #[test]
    fn test_student_restricted_to_self() {
        let own = student(3, Some(7));
        let other = student(4, Some(7));
        let actor = Actor::Student {
            id: 3,
            code: "s3".to_string(),
        };
        assert!(actor.can_view(&own));
        assert!(actor.can_deploy(&own));
        assert!(actor.can_delete(&own));
        assert!(!actor.can_deploy(&other));
    }

    #[test]
    fn test_student_may_generate_but_not_rotate_own_key() {
        let own = student(3, Some(7));
        let other = student(4, Some(7));
        let actor = Actor::Student {
            id: 3,
            code: "s3".to_string(),
        };
        assert!(actor.can_generate_deploy_key(&own, false));
        assert!(!actor.can_generate_deploy_key(&own, true));
        assert!(!actor.can_generate_deploy_key(&other, false));
        assert!(ensure_can_generate_deploy_key(&actor, &own, true).is_err());
    }

    #[test]
    fn test_deploy_token_only_deploys() {
        let s = student(5, Some(7));
        assert!(Actor::DeployToken.can_deploy(&s));
        assert!(!Actor::DeployToken.can_view(&s));
        assert!(!Actor::DeployToken.can_delete(&s));
        assert!(!Actor::DeployToken.can_generate_deploy_key(&s, false));
        assert!(!Actor::DeployToken.can_list_all());
        assert!(ensure_can_delete(&Actor::DeployToken, &s).is_err());
    }
}
