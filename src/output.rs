use std::io::{self, Write};

use crate::vision::{AnnotateImageResponse, EntityAnnotation, Feature, FeatureKind};

/// Writes one block per requested feature: a header line followed by one
/// indented line per detection, truncated to the feature's result cap. Text
/// detections carry no confidence score.
pub fn print_results(
    out: &mut impl Write,
    features: &[Feature],
    response: &AnnotateImageResponse,
) -> io::Result<()> {
    for feature in features {
        let (header, entries) = section(feature.kind, response);
        writeln!(out, "{header}:")?;
        let cap = usize::try_from(feature.max_results).unwrap_or(0);
        for (i, entry) in entries.iter().take(cap).enumerate() {
            match feature.kind {
                FeatureKind::Text => writeln!(out, "\t{i}: {}", entry.description)?,
                _ => writeln!(out, "\t{i}: {} ({:.6})", entry.description, entry.score)?,
            }
        }
    }
    Ok(())
}

fn section(
    kind: FeatureKind,
    response: &AnnotateImageResponse,
) -> (&'static str, &[EntityAnnotation]) {
    match kind {
        FeatureKind::Landmark => ("Landmarks", &response.landmark_annotations),
        FeatureKind::Logo => ("Logos", &response.logo_annotations),
        FeatureKind::Label => ("Labels", &response.label_annotations),
        FeatureKind::Text => ("Text", &response.text_annotations),
    }
}

/// Dumps the whole response as pretty-printed JSON.
pub fn print_raw(out: &mut impl Write, response: &AnnotateImageResponse) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(response)?;
    writeln!(out, "{json}")?;
    Ok(())
}
