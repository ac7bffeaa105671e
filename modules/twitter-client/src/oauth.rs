//! OAuth 1.0a request signing (HMAC-SHA1), as required by the v1.1 API.

use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use urlencoding::encode;

use crate::types::OAuthCredentials;

type HmacSha1 = Hmac<Sha1>;

/// Build the `Authorization` header value for a request.
///
/// `params` are the request's query/form parameters; they take part in the
/// signature but are not repeated in the header.
pub(crate) fn authorization_header(
    credentials: &OAuthCredentials,
    method: &str,
    url: &str,
    params: &[(&str, String)],
    nonce: &str,
    timestamp: i64,
) -> String {
    let mut oauth_params = vec![
        ("oauth_consumer_key", credentials.consumer_key.clone()),
        ("oauth_nonce", nonce.to_string()),
        ("oauth_signature_method", "HMAC-SHA1".to_string()),
        ("oauth_timestamp", timestamp.to_string()),
        ("oauth_token", credentials.access_token.clone()),
        ("oauth_version", "1.0".to_string()),
    ];

    let mut all: Vec<(&str, String)> = params.to_vec();
    all.extend(oauth_params.iter().cloned());

    let base = signature_base_string(method, url, &all);
    let signature = sign(
        &base,
        &credentials.consumer_secret,
        &credentials.access_token_secret,
    );
    oauth_params.push(("oauth_signature", signature));

    let fields: Vec<String> = oauth_params
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", encode(k), encode(v)))
        .collect();
    format!("OAuth {}", fields.join(", "))
}

/// `METHOD&enc(url)&enc(sorted, encoded params)`.
pub(crate) fn signature_base_string(method: &str, url: &str, params: &[(&str, String)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (encode(k).into_owned(), encode(v).into_owned()))
        .collect();
    encoded.sort();

    let param_string = encoded
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&");

    format!(
        "{}&{}&{}",
        method.to_uppercase(),
        encode(url),
        encode(&param_string)
    )
}

fn sign(base: &str, consumer_secret: &str, token_secret: &str) -> String {
    let key = format!("{}&{}", encode(consumer_secret), encode(token_secret));
    let mut mac =
        HmacSha1::new_from_slice(key.as_bytes()).expect("HMAC can take key of any size");
    mac.update(base.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}
