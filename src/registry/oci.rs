use super::{
    sha256_digest, Blob, CredentialChain, Image, RegistryCredentials, RegistryError,
    RegistryGateway,
};
use crate::reference::Reference;
use crate::settings::RegistrySettings;
use anyhow::{Context, Result};
use async_trait::async_trait;
use lazy_static::lazy_static;
use oci_distribution::{
    client::{ClientConfig, ClientProtocol},
    errors::{OciDistributionError, OciErrorCode},
    manifest::{
        OciImageManifest, IMAGE_MANIFEST_LIST_MEDIA_TYPE, IMAGE_MANIFEST_MEDIA_TYPE,
        OCI_IMAGE_INDEX_MEDIA_TYPE, OCI_IMAGE_MEDIA_TYPE,
    },
    secrets::RegistryAuth,
    Client, Reference as OciReference, RegistryOperation,
};
use regex::Regex;
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, LINK, WWW_AUTHENTICATE},
    RequestBuilder, Response, StatusCode,
};
use serde::Deserialize;
use std::collections::HashMap;
use url::Url;

/// Single-platform manifest types the gateway can mirror
const IMAGE_MEDIA_TYPES: &[&str] = &[OCI_IMAGE_MEDIA_TYPE, IMAGE_MANIFEST_MEDIA_TYPE];

/// Multi-platform manifest types, accepted on reads so they can be recognised and refused
const INDEX_MEDIA_TYPES: &[&str] = &[OCI_IMAGE_INDEX_MEDIA_TYPE, IMAGE_MANIFEST_LIST_MEDIA_TYPE];

lazy_static! {
    static ref CHALLENGE_PARAM_RE: Regex = Regex::new(r#"(\w+)="([^"]*)""#).unwrap();
    static ref NEXT_LINK_RE: Regex = Regex::new(r#"<([^>]+)>\s*;\s*rel="?next"?"#).unwrap();
}

/// Registry gateway speaking the OCI distribution protocol
///
/// Blob transfer and manifest pushes go through `oci-distribution`. Manifest
/// reads, tag listing and manifest deletion are plain HTTP so that the answer
/// is classified by status code, with the registry's bearer token challenge
/// answered once.
pub struct OciGateway {
    client: Client,
    http: reqwest::Client,
    credentials: CredentialChain,
    insecure_hosts: Vec<String>,
    tag_page_size: usize,
}

impl OciGateway {
    pub fn new(settings: &RegistrySettings, credentials: CredentialChain) -> Result<Self> {
        let client = Client::new(ClientConfig {
            protocol: ClientProtocol::HttpsExcept(settings.insecure_hosts.clone()),
            ..Default::default()
        });
        let http = reqwest::Client::builder()
            .user_agent(settings.user_agent.clone())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            http,
            credentials,
            insecure_hosts: settings.insecure_hosts.clone(),
            tag_page_size: settings.tag_page_size,
        })
    }

    async fn credentials_for(
        &self,
        reference: &Reference,
    ) -> Result<Option<RegistryCredentials>, RegistryError> {
        self.credentials
            .resolve(reference.registry())
            .await
            .map_err(|e| {
                RegistryError::Transport(format!(
                    "Failed to get credentials for {}: {:#}",
                    reference.registry(),
                    e
                ))
            })
    }

    async fn auth_for(&self, reference: &Reference) -> Result<RegistryAuth, RegistryError> {
        Ok(match self.credentials_for(reference).await? {
            Some(creds) => RegistryAuth::Basic(creds.username, creds.password),
            None => RegistryAuth::Anonymous,
        })
    }

    fn scheme(&self, registry: &str) -> &'static str {
        if self.insecure_hosts.iter().any(|h| h == registry) {
            "http"
        } else {
            "https"
        }
    }

    /// `<scheme>://<host>/v2/<repository>/<path>`
    fn v2_url(&self, reference: &Reference, path: &str) -> String {
        format!(
            "{}://{}/v2/{}/{}",
            self.scheme(reference.registry()),
            to_oci_reference(reference).resolve_registry(),
            reference.repository(),
            path
        )
    }

    /// Send the request built by `build`; on a 401 answer the challenge once and resend.
    async fn send_authorized<F>(
        &self,
        reference: &Reference,
        action: &str,
        build: F,
    ) -> Result<Response, RegistryError>
    where
        F: Fn() -> RequestBuilder,
    {
        let response = build().send().await.map_err(network_error)?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let creds = self.credentials_for(reference).await?;
        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let request = if challenge.to_ascii_lowercase().starts_with("bearer") {
            let token = self
                .fetch_token(&challenge_params(&challenge), reference, action, creds.as_ref())
                .await?;
            build().bearer_auth(token)
        } else if let Some(creds) = creds.as_ref() {
            build().basic_auth(&creds.username, Some(&creds.password))
        } else {
            return Err(RegistryError::Transport(format!(
                "{} requires authentication for {}",
                reference.registry(),
                reference.repository()
            )));
        };
        request.send().await.map_err(network_error)
    }

    /// Exchange credentials for a bearer token at the realm named by a `WWW-Authenticate` challenge
    async fn fetch_token(
        &self,
        params: &HashMap<String, String>,
        reference: &Reference,
        action: &str,
        creds: Option<&RegistryCredentials>,
    ) -> Result<String, RegistryError> {
        let realm = params.get("realm").ok_or_else(|| {
            RegistryError::Transport(format!(
                "{} sent a bearer challenge without realm",
                reference.registry()
            ))
        })?;
        let scope = params
            .get("scope")
            .cloned()
            .unwrap_or_else(|| format!("repository:{}:{}", reference.repository(), action));

        let mut url = Url::parse(realm).map_err(|e| {
            RegistryError::Transport(format!("Invalid token realm '{}': {}", realm, e))
        })?;
        {
            let mut query = url.query_pairs_mut();
            if let Some(service) = params.get("service") {
                query.append_pair("service", service);
            }
            query.append_pair("scope", &scope);
        }

        let mut request = self.http.get(url);
        if let Some(creds) = creds {
            request = request.basic_auth(&creds.username, Some(&creds.password));
        }
        let response = request.send().await.map_err(network_error)?;
        if !response.status().is_success() {
            return Err(RegistryError::Transport(format!(
                "Token request for {} failed with {}",
                reference.repository_name(),
                response.status()
            )));
        }

        #[derive(Deserialize)]
        struct TokenResponse {
            token: Option<String>,
            access_token: Option<String>,
        }

        let body: TokenResponse = response.json().await.map_err(network_error)?;
        body.token.or(body.access_token).ok_or_else(|| {
            RegistryError::Transport(format!(
                "Token response for {} carried no token",
                reference.repository_name()
            ))
        })
    }

    /// Raw manifest bytes and the Content-Type they were served with
    async fn fetch_manifest(
        &self,
        reference: &Reference,
    ) -> Result<(Vec<u8>, Option<String>), RegistryError> {
        let url = self.v2_url(reference, &format!("manifests/{}", reference.identifier()));
        let accept = IMAGE_MEDIA_TYPES
            .iter()
            .chain(INDEX_MEDIA_TYPES)
            .copied()
            .collect::<Vec<_>>()
            .join(", ");

        let response = self
            .send_authorized(reference, "pull", || {
                self.http.get(&url).header(ACCEPT, &accept)
            })
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(RegistryError::NotFound(reference.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RegistryError::Transport(format!(
                "GET {} returned {}: {}",
                url, status, body
            )));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_string());
        let raw = response.bytes().await.map_err(network_error)?.to_vec();
        Ok((raw, content_type))
    }
}

#[async_trait]
impl RegistryGateway for OciGateway {
    async fn get(&self, reference: &Reference) -> Result<Image, RegistryError> {
        let (raw, content_type) = self.fetch_manifest(reference).await?;

        let kind = manifest_kind(&raw, content_type.as_deref()).map_err(|e| {
            RegistryError::Transport(format!("Unreadable manifest for {}: {}", reference, e))
        })?;
        if kind.is_index {
            return Err(RegistryError::Transport(format!(
                "{} resolves to a multi-platform index ({}), which cannot be mirrored",
                reference, kind.media_type
            )));
        }

        let manifest: OciImageManifest = serde_json::from_slice(&raw).map_err(|e| {
            RegistryError::Transport(format!(
                "Unsupported manifest for {}: {}",
                reference, e
            ))
        })?;

        let oci_ref = to_oci_reference(reference);
        let auth = self.auth_for(reference).await?;
        self.client
            .auth(&oci_ref, &auth, RegistryOperation::Pull)
            .await
            .map_err(|e| classify_error(e, reference))?;

        let mut blobs = Vec::with_capacity(manifest.layers.len() + 1);
        for descriptor in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
            let mut data = Vec::new();
            self.client
                .pull_blob(&oci_ref, descriptor, &mut data)
                .await
                .map_err(|e| classify_error(e, reference))?;
            blobs.push(Blob {
                digest: descriptor.digest.clone(),
                media_type: descriptor.media_type.clone(),
                data,
            });
        }

        tracing::debug!("Pulled {} ({} blobs)", reference, blobs.len());
        Ok(Image::new(raw, kind.media_type, blobs))
    }

    async fn digest(&self, reference: &Reference) -> Result<String, RegistryError> {
        let (raw, _) = self.fetch_manifest(reference).await?;
        Ok(sha256_digest(&raw))
    }

    async fn write(&self, reference: &Reference, image: &Image) -> Result<(), RegistryError> {
        let oci_ref = to_oci_reference(reference);
        let auth = self.auth_for(reference).await?;

        self.client
            .auth(&oci_ref, &auth, RegistryOperation::Push)
            .await
            .map_err(|e| classify_error(e, reference))?;

        for blob in image.blobs() {
            self.client
                .push_blob(&oci_ref, &blob.data, &blob.digest)
                .await
                .map_err(|e| classify_error(e, reference))?;
            tracing::debug!("Pushed blob {} to {}", blob.digest, reference.repository_name());
        }

        let content_type = HeaderValue::from_str(image.media_type()).map_err(|e| {
            RegistryError::Transport(format!(
                "Invalid manifest media type '{}': {}",
                image.media_type(),
                e
            ))
        })?;
        self.client
            .push_manifest_raw(&oci_ref, image.manifest().to_vec(), content_type)
            .await
            .map_err(|e| classify_error(e, reference))?;

        Ok(())
    }

    /// Every tag in the repository.
    ///
    /// A short page does not end the listing: registries may cap `n`. Pages
    /// are followed through the `Link` header, or by `last=<last tag>` when
    /// the registry sends none, until an empty page comes back.
    async fn list_tags(&self, reference: &Reference) -> Result<Vec<String>, RegistryError> {
        let base = self.v2_url(reference, "tags/list");
        let mut url = page_url(&base, self.tag_page_size, None)?;
        let mut tags: Vec<String> = Vec::new();
        let mut last: Option<String> = None;

        loop {
            let response = self
                .send_authorized(reference, "pull", || self.http.get(url.clone()))
                .await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(classify_listing_response(status, &body, reference));
            }

            let next = next_link(response.headers(), &url);

            #[derive(Deserialize)]
            struct TagList {
                #[serde(default)]
                tags: Option<Vec<String>>,
            }

            let page: TagList = response.json().await.map_err(network_error)?;
            let page = page.tags.unwrap_or_default();
            let page_last = match page.last() {
                Some(tag) => tag.clone(),
                None => break,
            };
            if last.as_deref() == Some(page_last.as_str()) {
                return Err(RegistryError::Transport(format!(
                    "{} did not advance tag listing past '{}'",
                    reference.registry(),
                    page_last
                )));
            }

            tags.extend(page);
            url = match next {
                Some(next) => next,
                None => page_url(&base, self.tag_page_size, Some(&page_last))?,
            };
            last = Some(page_last);
        }

        tags.sort();
        tags.dedup();
        Ok(tags)
    }

    async fn delete(&self, reference: &Reference) -> Result<(), RegistryError> {
        let url = self.v2_url(reference, &format!("manifests/{}", reference.identifier()));
        let accept = IMAGE_MEDIA_TYPES.join(", ");

        let response = self
            .send_authorized(reference, "delete", || {
                self.http.delete(&url).header(ACCEPT, &accept)
            })
            .await?;

        let status = response.status();
        match status {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound(reference.to_string())),
            StatusCode::METHOD_NOT_ALLOWED => Err(RegistryError::Unsupported {
                registry: reference.registry().to_string(),
                operation: "manifest deletion",
            }),
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(RegistryError::Transport(format!(
                    "DELETE {} returned {}: {}",
                    url, status, body
                )))
            }
        }
    }
}

fn to_oci_reference(reference: &Reference) -> OciReference {
    match reference.digest() {
        Some(digest) => OciReference::with_digest(
            reference.registry().to_string(),
            reference.repository().to_string(),
            digest.to_string(),
        ),
        None => OciReference::with_tag(
            reference.registry().to_string(),
            reference.repository().to_string(),
            reference.identifier().to_string(),
        ),
    }
}

struct ManifestKind {
    media_type: String,
    is_index: bool,
}

/// Media type of a raw manifest: its `mediaType` field, else the served
/// Content-Type. A `manifests` array marks an index even without either.
fn manifest_kind(raw: &[u8], content_type: Option<&str>) -> Result<ManifestKind, serde_json::Error> {
    #[derive(Deserialize)]
    struct Head {
        #[serde(rename = "mediaType")]
        media_type: Option<String>,
        manifests: Option<serde_json::Value>,
    }

    let head: Head = serde_json::from_slice(raw)?;
    let has_manifests = head.manifests.is_some();
    let media_type = head
        .media_type
        .or_else(|| content_type.map(str::to_string))
        .unwrap_or_else(|| {
            if has_manifests {
                OCI_IMAGE_INDEX_MEDIA_TYPE.to_string()
            } else {
                OCI_IMAGE_MEDIA_TYPE.to_string()
            }
        });
    let is_index = has_manifests || INDEX_MEDIA_TYPES.contains(&media_type.as_str());

    Ok(ManifestKind {
        media_type,
        is_index,
    })
}

fn page_url(base: &str, page_size: usize, last: Option<&str>) -> Result<Url, RegistryError> {
    let mut url = Url::parse(base)
        .map_err(|e| RegistryError::Transport(format!("Invalid registry URL '{}': {}", base, e)))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("n", &page_size.to_string());
        if let Some(last) = last {
            query.append_pair("last", last);
        }
    }
    Ok(url)
}

/// Target of a `Link: <...>; rel="next"` header, resolved against the current page
fn next_link(headers: &HeaderMap, current: &Url) -> Option<Url> {
    headers
        .get_all(LINK)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|v| NEXT_LINK_RE.captures(v).map(|caps| caps[1].to_string()))
        .and_then(|target| current.join(&target).ok())
}

/// `key="value"` parameters of a `WWW-Authenticate` header
fn challenge_params(header: &str) -> HashMap<String, String> {
    CHALLENGE_PARAM_RE
        .captures_iter(header)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect()
}

fn network_error(err: reqwest::Error) -> RegistryError {
    RegistryError::Transport(err.to_string())
}

/// Error codes of an OCI error envelope body; empty when the body is not one
fn envelope_codes(body: &str) -> Vec<String> {
    #[derive(Deserialize)]
    struct Envelope {
        #[serde(default)]
        errors: Vec<Entry>,
    }

    #[derive(Deserialize)]
    struct Entry {
        code: String,
    }

    serde_json::from_str::<Envelope>(body)
        .map(|envelope| envelope.errors.into_iter().map(|e| e.code).collect())
        .unwrap_or_default()
}

fn classify_error(err: OciDistributionError, reference: &Reference) -> RegistryError {
    let not_found = match &err {
        OciDistributionError::ImageManifestNotFoundError(_) => true,
        OciDistributionError::RegistryError { envelope, .. } => envelope.errors.iter().any(|e| {
            matches!(
                e.code,
                OciErrorCode::ManifestUnknown | OciErrorCode::NameUnknown | OciErrorCode::BlobUnknown
            )
        }),
        OciDistributionError::ServerError { code, .. } => *code == 404,
        _ => false,
    };

    if not_found {
        RegistryError::NotFound(reference.to_string())
    } else {
        RegistryError::Transport(err.to_string())
    }
}

/// Classify a failed `/tags/list` answer.
///
/// An unknown repository is `NotFound`. A registry that refuses listing (405,
/// an `UNSUPPORTED` code, or a 404 that does not name the repository as
/// unknown) is `Unsupported`.
fn classify_listing_response(status: StatusCode, body: &str, reference: &Reference) -> RegistryError {
    let codes = envelope_codes(body);
    let has_code = |code: &str| codes.iter().any(|c| c == code);

    if status == StatusCode::NOT_FOUND && has_code("NAME_UNKNOWN") {
        RegistryError::NotFound(reference.repository_name())
    } else if status == StatusCode::METHOD_NOT_ALLOWED
        || status == StatusCode::NOT_FOUND
        || has_code("UNSUPPORTED")
    {
        RegistryError::Unsupported {
            registry: reference.registry().to_string(),
            operation: "tag listing",
        }
    } else {
        RegistryError::Transport(format!(
            "listing tags of {} returned {}: {}",
            reference.repository_name(),
            status,
            body
        ))
    }
}
