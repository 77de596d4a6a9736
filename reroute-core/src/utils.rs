use url::Url;

/// Resolves a request path against an upstream base URL.
///
/// Leading `/` characters are stripped from `rewritten` first, so the result is
/// always resolved underneath the base path instead of replacing it. An
/// absolute URL still resolves to its own path. Only the path and a non-empty
/// query survive; the fragment is dropped.
///
/// # Examples
///
/// ```
/// use url::Url;
/// use reroute_core::utils::resolve_forward_path;
///
/// let base = Url::parse("https://api.example.com:443/base/").unwrap();
/// let path = resolve_forward_path(&base, "/foo?x=1").unwrap();
/// assert_eq!(path, "/base/foo?x=1");
/// ```
pub fn resolve_forward_path(base: &Url, rewritten: &str) -> Result<String, url::ParseError> {
    let relative = rewritten.trim_start_matches('/');
    let resolved = base.join(relative)?;

    let mut path = resolved.path().to_string();
    if let Some(query) = resolved.query().filter(|query| !query.is_empty()) {
        path.push('?');
        path.push_str(query);
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base(url: &str) -> Url {
        Url::parse(url).unwrap()
    }

    #[test]
    fn test_resolves_under_base_path() {
        let base = base("https://api.example.com:443/base/");
        assert_eq!(
            resolve_forward_path(&base, "/foo?x=1").unwrap(),
            "/base/foo?x=1"
        );
    }

    #[test]
    fn test_strips_every_leading_slash() {
        let base = base("http://svc:8080/root/");
        assert_eq!(
            resolve_forward_path(&base, "///evil.example/x").unwrap(),
            "/root/evil.example/x"
        );
    }

    #[test]
    fn test_empty_input_resolves_to_base() {
        let base = base("http://svc:8080/root/");
        assert_eq!(resolve_forward_path(&base, "").unwrap(), "/root/");
        assert_eq!(resolve_forward_path(&base, "/").unwrap(), "/root/");
    }

    #[test]
    fn test_empty_query_and_fragment_are_dropped() {
        let base = base("http://svc:8080/");
        assert_eq!(resolve_forward_path(&base, "/a?").unwrap(), "/a");
        assert_eq!(resolve_forward_path(&base, "/a?b=1#frag").unwrap(), "/a?b=1");
    }

    #[test]
    fn test_dot_segments_are_normalized() {
        let base = base("http://svc:8080/root/");
        assert_eq!(resolve_forward_path(&base, "../up").unwrap(), "/up");
    }

    #[test]
    fn test_absolute_rewrite_keeps_only_path_and_query() {
        let base = base("http://svc:8080/root/");
        assert_eq!(
            resolve_forward_path(&base, "https://other.example/x/y?z=2").unwrap(),
            "/x/y?z=2"
        );
    }
}
