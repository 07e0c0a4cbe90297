use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("login is empty after normalization")]
    EmptyLogin,
    #[error("evaluation id is empty after normalization")]
    EmptyEvaluationId,
}

/// Directory-safe user id: the login's local part, lowercased, with every
/// character outside `[a-z0-9]` replaced by `_`.
pub fn normalize_user_id(login: &str) -> Result<String, PathError> {
    let local = login.trim().split('@').next().unwrap_or_default();
    let id: String = local
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() { c } else { '_' }
        })
        .collect();
    if id.chars().all(|c| c == '_') {
        return Err(PathError::EmptyLogin);
    }
    Ok(id)
}

pub fn generate_user_file_name(login: &str) -> Result<String, PathError> {
    Ok(format!("users/{}.json", normalize_user_id(login)?))
}

pub fn user_evaluations_dir(login: &str) -> Result<String, PathError> {
    Ok(format!("users/{}/evaluations", normalize_user_id(login)?))
}

pub fn evaluation_file_path(login: &str, evaluation_id: &str) -> Result<String, PathError> {
    let name: String = evaluation_id
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if name.chars().all(|c| c == '_') {
        return Err(PathError::EmptyEvaluationId);
    }
    Ok(format!("{}/{name}.yml", user_evaluations_dir(login)?))
}

pub fn index_file_path(login: &str) -> Result<String, PathError> {
    Ok(format!("{}/index.json", user_evaluations_dir(login)?))
}

/// Evaluation id recovered from a file name inside the evaluations directory.
pub fn evaluation_id_from_file_name(name: &str) -> Option<&str> {
    name.strip_suffix(".yml")
        .or_else(|| name.strip_suffix(".yaml"))
        .filter(|stem| !stem.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logins_differing_only_in_case_and_punctuation_share_a_path() {
        let a = generate_user_file_name("John.Doe+test@Example.COM").unwrap();
        let b = generate_user_file_name("john.doe+test@example.com").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "users/john_doe_test.json");
    }

    #[test]
    fn evaluation_paths_live_under_the_user_directory() {
        assert_eq!(
            evaluation_file_path("jdoe@example.com", "eval-2024-05-01-sgt-smith-abc123").unwrap(),
            "users/jdoe/evaluations/eval-2024-05-01-sgt-smith-abc123.yml"
        );
        assert_eq!(
            index_file_path("jdoe@example.com").unwrap(),
            "users/jdoe/evaluations/index.json"
        );
    }

    #[test]
    fn ids_cannot_escape_the_directory() {
        let path = evaluation_file_path("jdoe", "../../etc/passwd").unwrap();
        assert_eq!(path, "users/jdoe/evaluations/______etc_passwd.yml");
        assert_eq!(evaluation_file_path("jdoe", "///"), Err(PathError::EmptyEvaluationId));
    }

    #[test]
    fn empty_logins_are_rejected() {
        assert_eq!(normalize_user_id("@example.com"), Err(PathError::EmptyLogin));
        assert_eq!(normalize_user_id("  "), Err(PathError::EmptyLogin));
    }

    #[test]
    fn file_names_map_back_to_ids() {
        assert_eq!(evaluation_id_from_file_name("eval-1.yml"), Some("eval-1"));
        assert_eq!(evaluation_id_from_file_name("index.json"), None);
        assert_eq!(evaluation_id_from_file_name(".yml"), None);
    }
}
