// ====================================================================================
// src/auth.rs - 当前操作者与归属校验
// ====================================================================================
use crate::error::AppError;
use http::{HeaderMap, HeaderName};

// 身份由外部网关注入，这里只读取不透明的用户标识
pub static ACTOR_HEADER: HeaderName = HeaderName::from_static("x-user-id");

pub fn current_actor(headers: &HeaderMap) -> Option<String> {
    headers
        .get(&ACTOR_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|actor| !actor.is_empty())
        .map(str::to_string)
}

/// A resource without an owner is open to anyone.
pub fn is_owner(owner: Option<&str>, actor: Option<&str>) -> bool {
    match owner {
        None => true,
        Some(owner) => actor == Some(owner),
    }
}

pub fn ensure_owner(owner: Option<&str>, actor: Option<&str>) -> Result<(), AppError> {
    if is_owner(owner, actor) {
        Ok(())
    } else {
        Err(AppError::Forbidden("You do not own this resource".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn unowned_resources_are_open() {
        assert!(is_owner(None, None));
        assert!(is_owner(None, Some("alice")));
    }

    #[test]
    fn owned_resources_require_the_owner() {
        assert!(is_owner(Some("alice"), Some("alice")));
        assert!(!is_owner(Some("alice"), Some("bob")));
        assert!(!is_owner(Some("alice"), None));
        assert!(matches!(ensure_owner(Some("alice"), None), Err(AppError::Forbidden(_))));
    }

    #[test]
    fn reads_actor_from_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(current_actor(&headers), None);
        headers.insert(ACTOR_HEADER.clone(), HeaderValue::from_static(" alice "));
        assert_eq!(current_actor(&headers).as_deref(), Some("alice"));
        headers.insert(ACTOR_HEADER.clone(), HeaderValue::from_static(""));
        assert_eq!(current_actor(&headers), None);
    }
}
