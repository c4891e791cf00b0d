use std::borrow::Cow;

/// Normalize a bind/listen address.
///
/// Config shorthand `":PORT"` means "bind on all interfaces"; Tokio's bind
/// APIs do not accept it, so it is rewritten to `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Public-interface bind address for a registered proxy port.
pub fn public_bind_addr(port: u16) -> String {
    format!("0.0.0.0:{port}")
}

/// Loopback dial address for a client-side local service.
pub fn loopback_addr(port: u16) -> String {
    format!("127.0.0.1:{port}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":9000").as_ref(), "0.0.0.0:9000");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
    }

    #[test]
    fn normalize_bind_addr_passthrough() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:9000").as_ref(),
            "127.0.0.1:9000"
        );
        assert_eq!(normalize_bind_addr("[::]:9000").as_ref(), "[::]:9000");
    }

    #[test]
    fn dial_and_bind_helpers() {
        assert_eq!(public_bind_addr(8080), "0.0.0.0:8080");
        assert_eq!(loopback_addr(3000), "127.0.0.1:3000");
    }
}
