use std::borrow::Cow;

/// Normalize a bind/listen address.
///
/// Config files commonly use the shorthand `":PORT"` to mean "bind on all
/// interfaces". Tokio bind APIs do not accept `":PORT"`, so it becomes
/// `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Splits `host:port` or `[v6]:port`. Brackets are stripped from IPv6 hosts.
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let addr = addr.trim();
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        (host, tail.strip_prefix(':')?)
    } else {
        let (host, port) = addr.rsplit_once(':')?;
        if host.contains(':') {
            return None;
        }
        (host, port)
    };
    if host.is_empty() {
        return None;
    }
    Some((host, port.parse().ok()?))
}
