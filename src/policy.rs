use crate::codec::Compression;
use crate::http::Verb;
use crate::transform::ContentEnvelope;

/// Outbound transform settings of one handler type.
///
/// Read on every response, never mutated after the handler type is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformPolicy {
    /// Compress responses even when the client sent nothing compressed.
    pub force_compress: bool,
    /// Mirror the client's compression kind when it supplied one.
    pub follow_client_compress: bool,
    /// Kind used when the server decides to compress.
    pub server_compression: Compression,
    /// Payloads shorter than this are never compressed.
    pub min_compress_size: usize,
    pub force_encrypt: bool,
    pub follow_client_encrypt: bool,
    /// Chain forced onto GET responses (and every non-POST verb).
    pub get_chain: Option<String>,
    /// Chain forced onto POST responses.
    pub post_chain: Option<String>,
}

impl Default for TransformPolicy {
    fn default() -> Self {
        TransformPolicy {
            force_compress: false,
            follow_client_compress: true,
            server_compression: Compression::Gzip,
            min_compress_size: 256,
            force_encrypt: false,
            follow_client_encrypt: true,
            get_chain: None,
            post_chain: Some("a".to_string()),
        }
    }
}

impl TransformPolicy {
    /// Never transforms a response, whatever the client sent.
    pub fn pass_through() -> Self {
        TransformPolicy {
            follow_client_compress: false,
            follow_client_encrypt: false,
            ..TransformPolicy::default()
        }
    }

    /// Forces `kind` on every response. The client's own kind still wins when
    /// `follow_client_compress` is set and it sent one.
    pub fn force_compression(mut self, kind: Compression) -> Self {
        self.force_compress = true;
        self.server_compression = kind;
        self
    }

    /// Forces the per-verb chains on every response.
    pub fn force_encryption(mut self, get_chain: Option<&str>, post_chain: Option<&str>) -> Self {
        self.force_encrypt = true;
        self.get_chain = get_chain.map(str::to_owned);
        self.post_chain = post_chain.map(str::to_owned);
        self
    }

    pub fn follow_client(mut self, compress: bool, encrypt: bool) -> Self {
        self.follow_client_compress = compress;
        self.follow_client_encrypt = encrypt;
        self
    }

    pub fn min_compress_size(mut self, size: usize) -> Self {
        self.min_compress_size = size;
        self
    }

    pub fn server_chain(&self, verb: Verb) -> Option<&str> {
        match verb {
            Verb::Get => self.get_chain.as_deref(),
            Verb::Post => self.post_chain.as_deref(),
        }
    }

    /// Picks the chain and compression for a response, given what the client
    /// announced on its request.
    ///
    /// When forcing, following the client means "use the client's choice if it
    /// made one, the server's otherwise". When not forcing, following the client
    /// mirrors it and not following disables the transform.
    pub fn negotiate(&self, verb: Verb, client: &ContentEnvelope) -> (String, Compression) {
        let compression = if self.force_compress {
            if self.follow_client_compress && !client.compression.is_none() {
                client.compression
            } else {
                self.server_compression
            }
        } else if self.follow_client_compress {
            client.compression
        } else {
            Compression::None
        };

        let chain = if self.force_encrypt {
            if self.follow_client_encrypt && !client.encrypt_chain.is_empty() {
                client.encrypt_chain.clone()
            } else {
                self.server_chain(verb).unwrap_or_default().to_owned()
            }
        } else if self.follow_client_encrypt {
            client.encrypt_chain.clone()
        } else {
            String::new()
        };

        (chain, compression)
    }
}
