use anyhow::{bail, Context, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio::time::{timeout_at, Instant};
use tracing::debug;
use url::Url;

const DEFAULT_ENDPOINT: &str = "https://vision.googleapis.com";

/// Detections the annotation service can run over an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FeatureKind {
    #[serde(rename = "LANDMARK_DETECTION")]
    Landmark,
    #[serde(rename = "LOGO_DETECTION")]
    Logo,
    #[serde(rename = "LABEL_DETECTION")]
    Label,
    #[serde(rename = "TEXT_DETECTION")]
    Text,
}

impl FeatureKind {
    pub const ALL: [FeatureKind; 4] = [
        FeatureKind::Landmark,
        FeatureKind::Logo,
        FeatureKind::Label,
        FeatureKind::Text,
    ];
}

impl fmt::Display for FeatureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FeatureKind::Landmark => "landmark",
            FeatureKind::Logo => "logo",
            FeatureKind::Label => "label",
            FeatureKind::Text => "text",
        };
        f.write_str(name)
    }
}

impl FromStr for FeatureKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "landmark" => Ok(FeatureKind::Landmark),
            "logo" => Ok(FeatureKind::Logo),
            "label" => Ok(FeatureKind::Label),
            "text" => Ok(FeatureKind::Text),
            _ => bail!("unknown feature {s:?}, expected one of: landmark, logo, label, text"),
        }
    }
}

/// One detector to run, with the number of results to ask for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Feature {
    #[serde(rename = "type")]
    pub kind: FeatureKind,
    pub max_results: i32,
}

/// A `--features` item: a feature name with an optional `=N` cap override.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSpec {
    pub kind: FeatureKind,
    pub max_results: Option<i32>,
}

impl FromStr for FeatureSpec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('=') {
            Some((name, cap)) => {
                let max_results = cap
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid result cap in feature spec {s:?}"))?;
                Ok(FeatureSpec {
                    kind: name.trim().parse()?,
                    max_results: Some(max_results),
                })
            }
            None => Ok(FeatureSpec {
                kind: s.trim().parse()?,
                max_results: None,
            }),
        }
    }
}

#[derive(Serialize)]
struct AnnotateRequest<'a> {
    requests: Vec<AnnotateItem<'a>>,
}

#[derive(Serialize)]
struct AnnotateItem<'a> {
    image: Image<'a>,
    features: &'a [Feature],
}

#[derive(Serialize)]
struct Image<'a> {
    source: ImageSource<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageSource<'a> {
    image_uri: &'a str,
}

/// One detection hit. The service leaves `score` out for text detection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityAnnotation {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub score: f32,
}

/// Error status attached to a failed per-image response.
#[derive(Debug, Serialize, Deserialize)]
pub struct RpcStatus {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
}

/// Annotation results for a single image, one list per detector. Detectors
/// that were not requested (or found nothing) come back as empty lists.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnotateImageResponse {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub landmark_annotations: Vec<EntityAnnotation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logo_annotations: Vec<EntityAnnotation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub label_annotations: Vec<EntityAnnotation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub text_annotations: Vec<EntityAnnotation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcStatus>,
}

#[derive(Deserialize)]
struct BatchAnnotateResponse {
    #[serde(default)]
    responses: Vec<AnnotateImageResponse>,
}

/// Client for the `images:annotate` endpoint of the vision service.
pub struct VisionClient {
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
}

impl VisionClient {
    pub fn new(api_key: Option<String>) -> Self {
        let endpoint = Url::parse(DEFAULT_ENDPOINT).expect("default endpoint is a valid URL");
        Self::with_endpoint(endpoint, api_key)
    }

    pub fn with_endpoint(endpoint: Url, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint,
            api_key,
        }
    }

    /// Runs the configured detectors over an already-uploaded image,
    /// referenced purely by its `gs://` URI.
    pub async fn annotate(
        &self,
        image_uri: &str,
        features: &[Feature],
        deadline: Instant,
    ) -> Result<AnnotateImageResponse> {
        let mut url = self
            .endpoint
            .join("v1/images:annotate")
            .context("failed to build annotate URL")?;
        if let Some(key) = &self.api_key {
            url.query_pairs_mut().append_pair("key", key);
        }

        let body = AnnotateRequest {
            requests: vec![AnnotateItem {
                image: Image {
                    source: ImageSource { image_uri },
                },
                features,
            }],
        };
        debug!(image_uri, features = features.len(), "requesting annotations");

        let response = timeout_at(deadline, self.client.post(url).json(&body).send())
            .await
            .with_context(|| format!("timed out requesting annotations for {image_uri}"))?
            .with_context(|| format!("failed to request annotations for {image_uri}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = timeout_at(deadline, response.text())
                .await
                .context("timed out reading annotation response")?
                .unwrap_or_default();
            bail!("annotation request failed with status {status}: {body}");
        }

        let batch: BatchAnnotateResponse = timeout_at(deadline, response.json())
            .await
            .context("timed out reading annotation response")?
            .context("failed to decode annotation response")?;
        let annotations = batch
            .responses
            .into_iter()
            .next()
            .context("annotation response contained no results")?;
        if let Some(error) = &annotations.error {
            bail!(
                "annotation service reported an error for {image_uri}: {} (code {})",
                error.message,
                error.code
            );
        }

        Ok(annotations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[test]
    fn feature_spec_parses_bare_names() {
        let spec: FeatureSpec = "label".parse().unwrap();
        assert_eq!(spec.kind, FeatureKind::Label);
        assert_eq!(spec.max_results, None);
    }

    #[test]
    fn feature_spec_parses_cap_overrides() {
        let spec: FeatureSpec = "text=4".parse().unwrap();
        assert_eq!(spec.kind, FeatureKind::Text);
        assert_eq!(spec.max_results, Some(4));
    }

    #[test]
    fn feature_spec_rejects_unknown_names_and_bad_caps() {
        let err = "face".parse::<FeatureSpec>().unwrap_err();
        assert!(err.to_string().contains("unknown feature"));
        assert!("label=lots".parse::<FeatureSpec>().is_err());
    }

    #[test]
    fn features_serialize_to_the_wire_format() {
        let feature = Feature {
            kind: FeatureKind::Label,
            max_results: 3,
        };
        assert_eq!(
            serde_json::to_value(&feature).unwrap(),
            serde_json::json!({ "type": "LABEL_DETECTION", "maxResults": 3 })
        );
    }

    #[tokio::test]
    async fn annotate_sends_the_uri_and_per_feature_caps() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images:annotate"))
            .and(body_partial_json(serde_json::json!({
                "requests": [{
                    "image": { "source": { "imageUri": "gs://b/pic.jpg" } },
                    "features": [
                        { "type": "LABEL_DETECTION", "maxResults": 8 },
                        { "type": "TEXT_DETECTION", "maxResults": 4 },
                    ],
                }]
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "responses": [{
                    "labelAnnotations": [
                        { "description": "Beach", "score": 0.92 },
                    ],
                }]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = VisionClient::with_endpoint(server.uri().parse().unwrap(), None);
        let features = [
            Feature {
                kind: FeatureKind::Label,
                max_results: 8,
            },
            Feature {
                kind: FeatureKind::Text,
                max_results: 4,
            },
        ];
        let response = client
            .annotate("gs://b/pic.jpg", &features, far_deadline())
            .await
            .unwrap();
        assert_eq!(response.label_annotations.len(), 1);
        assert_eq!(response.label_annotations[0].description, "Beach");
        assert!(response.text_annotations.is_empty());
    }

    #[tokio::test]
    async fn api_key_is_sent_as_a_query_parameter() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(query_param("key", "k123"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "responses": [{}] })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client =
            VisionClient::with_endpoint(server.uri().parse().unwrap(), Some("k123".to_string()));
        client
            .annotate("gs://b/pic.jpg", &[], far_deadline())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn per_image_errors_surface_as_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "responses": [{
                    "error": { "code": 7, "message": "permission denied" },
                }]
            })))
            .mount(&server)
            .await;

        let client = VisionClient::with_endpoint(server.uri().parse().unwrap(), None);
        let err = client
            .annotate("gs://b/pic.jpg", &[], far_deadline())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("permission denied"));
    }

    #[tokio::test]
    async fn empty_batch_responses_are_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "responses": [] })),
            )
            .mount(&server)
            .await;

        let client = VisionClient::with_endpoint(server.uri().parse().unwrap(), None);
        let err = client
            .annotate("gs://b/pic.jpg", &[], far_deadline())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no results"));
    }

    #[tokio::test]
    async fn non_success_statuses_are_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("backend exploded"))
            .mount(&server)
            .await;

        let client = VisionClient::with_endpoint(server.uri().parse().unwrap(), None);
        let err = client
            .annotate("gs://b/pic.jpg", &[], far_deadline())
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("500"), "unexpected error: {message}");
    }
}
