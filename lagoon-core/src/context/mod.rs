use keys::{PeerAddr, ServerName};

pub mod keys;

certain_map::certain_map! {
    #[derive(Debug, Clone)]
    #[default(EmptyContext)]
    pub struct Context {
        // Set by ContextService
        peer_addr: PeerAddr,
        // Set by the TLS accept path when SNI is present
        server_name: Option<ServerName>,
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use certain_map::ParamSet;
    use service_async::ParamRef;

    use super::{keys::*, Context};

    #[test]
    fn test_add_entries_to_context() {
        let ctx = Context::new();
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let ctx = ctx.param_set(PeerAddr(addr));
        assert_eq!(ParamRef::<PeerAddr>::param_ref(&ctx).0, addr);
    }
}
