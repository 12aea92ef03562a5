//! Client bound to the server's own endpoint.

use std::ops::Deref;
use std::time::Duration;

use super::RpcClient;
use crate::server::registry::ServiceDescriptor;

/// Client targeting the local server, with one stub per registered
/// descriptor at its current API version.
#[derive(Debug, Clone)]
pub struct AutoClient(RpcClient);

impl AutoClient {
    pub fn new<'a>(
        port: u16,
        descriptors: impl IntoIterator<Item = &'a ServiceDescriptor>,
        timeout: Duration,
    ) -> Self {
        let builder = descriptors.into_iter().fold(
            RpcClient::builder("127.0.0.1", port).name("auto").timeout(Some(timeout)),
            |builder, d| builder.stub(d.name.clone(), d.current_version),
        );
        Self(builder.build())
    }

    pub fn client(&self) -> &RpcClient {
        &self.0
    }
}

impl Deref for AutoClient {
    type Target = RpcClient;

    fn deref(&self) -> &RpcClient {
        &self.0
    }
}
