//! SDMX 2.1 XML payloads served by WITS.
//!
//! Two documents are understood: the generic-data tariff series returned per
//! country pair, and the structure codelist that enumerates reporter codes.

use crate::harvest::traits::HarvestStage;
use crate::model::{CountryPair, RawObservation};
use crate::traits::ParseError;
use chrono::NaiveDate;
use roxmltree::{Document, Node};
use std::collections::BTreeMap;
use tracing::debug;

const GENERIC_NS: &str = "http://www.sdmx.org/resources/sdmxml/schemas/v2_1/data/generic";
const STRUCTURE_NS: &str = "http://www.sdmx.org/resources/sdmxml/schemas/v2_1/structure";
const COMMON_NS: &str = "http://www.sdmx.org/resources/sdmxml/schemas/v2_1/common";

const COUNTRY_CODELIST_ID: &str = "CL_COUNTRY_WITS";

/// Raw observations of one pair, grouped by product code.
pub type ObservationsByProduct = BTreeMap<String, Vec<RawObservation>>;

/// Response body fetched for one country pair.
#[derive(Debug, Clone)]
pub struct FetchedPayload {
    pub pair: CountryPair,
    pub body: Vec<u8>,
}

/// Parses tariff series out of generic-data payloads.
#[derive(Debug, Default, Clone, Copy)]
pub struct SdmxExtractor;

impl HarvestStage for SdmxExtractor {
    type Input = FetchedPayload;
    type Output = ObservationsByProduct;
    type Error = ParseError;

    fn execute(&self, input: Self::Input) -> Result<Self::Output, Self::Error> {
        extract(&input.body, &input.pair.origin, &input.pair.destination)
    }

    fn stage_name(&self) -> &'static str {
        "sdmx_extract"
    }
}

fn parse_document(payload: &[u8]) -> Result<Document<'_>, ParseError> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| ParseError::Malformed(format!("payload is not UTF-8: {e}")))?;
    Document::parse(text).map_err(|e| ParseError::Malformed(e.to_string()))
}

fn child<'a, 'input>(node: Node<'a, 'input>, ns: &str, name: &str) -> Option<Node<'a, 'input>> {
    node.children().find(|c| c.has_tag_name((ns, name)))
}

/// Extracts per-year observations grouped by product code.
///
/// A series without a product code is skipped, as is any observation whose
/// year or rate cannot be read. A document without series yields an empty map.
///
/// # Errors
///
/// Returns [`ParseError::Malformed`] only if the payload is not well-formed XML.
pub fn extract(
    payload: &[u8],
    origin: &str,
    destination: &str,
) -> Result<ObservationsByProduct, ParseError> {
    let doc = parse_document(payload)?;
    let mut by_product = ObservationsByProduct::new();

    for series in doc
        .descendants()
        .filter(|n| n.has_tag_name((GENERIC_NS, "Series")))
    {
        let Some(product_code) = series_product_code(series) else {
            debug!(origin, destination, "Skipping series without product code");
            continue;
        };

        let observations = by_product.entry(product_code.to_string()).or_default();
        for obs in series
            .children()
            .filter(|c| c.has_tag_name((GENERIC_NS, "Obs")))
        {
            match read_observation(obs) {
                Some((year, percent)) => observations.push(RawObservation {
                    origin: origin.to_string(),
                    destination: destination.to_string(),
                    product_code: product_code.to_string(),
                    effective_year: year,
                    ad_valorem_percent: percent,
                }),
                None => debug!(
                    origin,
                    destination, product_code, "Skipping unreadable observation"
                ),
            }
        }
    }

    Ok(by_product)
}

fn series_product_code<'a>(series: Node<'a, '_>) -> Option<&'a str> {
    let key = child(series, GENERIC_NS, "SeriesKey")?;
    key.children()
        .filter(|c| c.has_tag_name((GENERIC_NS, "Value")))
        .find(|v| v.attribute("id") == Some("PRODUCTCODE"))
        .and_then(|v| v.attribute("value"))
        .map(str::trim)
        .filter(|code| !code.is_empty())
}

fn read_observation(obs: Node<'_, '_>) -> Option<(i32, f64)> {
    let year = obs
        .children()
        .filter(|c| c.has_tag_name((GENERIC_NS, "ObsDimension")))
        .find(|d| d.attribute("id") == Some("TIME_PERIOD"))?
        .attribute("value")?
        .trim()
        .parse::<i32>()
        .ok()?;
    NaiveDate::from_ymd_opt(year, 1, 1)?;

    let percent = child(obs, GENERIC_NS, "ObsValue")?
        .attribute("value")?
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())?;

    Some((year, percent))
}

/// Reads the WITS country codelist into code → name.
///
/// Only codes starting with a digit are kept; alphabetic reporter groups are
/// dropped. A missing codelist yields an empty map.
///
/// # Errors
///
/// Returns [`ParseError::Malformed`] if the payload is not well-formed XML.
pub fn parse_country_codes(payload: &[u8]) -> Result<BTreeMap<String, String>, ParseError> {
    let doc = parse_document(payload)?;
    let mut countries = BTreeMap::new();

    let Some(codelist) = doc.descendants().find(|n| {
        n.has_tag_name((STRUCTURE_NS, "Codelist")) && n.attribute("id") == Some(COUNTRY_CODELIST_ID)
    }) else {
        return Ok(countries);
    };

    for code in codelist
        .children()
        .filter(|c| c.has_tag_name((STRUCTURE_NS, "Code")))
    {
        let Some(id) = code.attribute("id") else {
            continue;
        };
        if !id.starts_with(|c: char| c.is_ascii_digit()) {
            continue;
        }
        let name = child(code, COMMON_NS, "Name")
            .and_then(|n| n.text())
            .map(str::trim)
            .unwrap_or("Unknown");
        countries.insert(id.to_string(), name.to_string());
    }

    Ok(countries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(product: Option<&str>, obs: &[(&str, &str)]) -> String {
        let key = match product {
            Some(code) => format!(r#"<generic:Value id="PRODUCTCODE" value="{code}"/>"#),
            None => String::new(),
        };
        let observations: String = obs
            .iter()
            .map(|(year, value)| {
                format!(
                    r#"<generic:Obs><generic:ObsDimension id="TIME_PERIOD" value="{year}"/><generic:ObsValue value="{value}"/></generic:Obs>"#
                )
            })
            .collect();
        format!(
            r#"<generic:Series><generic:SeriesKey><generic:Value id="FREQ" value="A"/>{key}</generic:SeriesKey>{observations}</generic:Series>"#
        )
    }

    fn document(series: &[String]) -> Vec<u8> {
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<message:GenericData xmlns:message="http://www.sdmx.org/resources/sdmxml/schemas/v2_1/message" xmlns:generic="{GENERIC_NS}">
  <message:DataSet>{}</message:DataSet>
</message:GenericData>"#,
            series.concat()
        )
        .into_bytes()
    }

    #[test]
    fn test_extract_groups_by_product() {
        let payload = document(&[
            series(Some("847330"), &[("2000", "10"), ("2001", "12.5")]),
            series(Some("851712"), &[("1999", "0")]),
        ]);

        let result = extract(&payload, "004", "840").unwrap();
        assert_eq!(result.len(), 2);

        let first = &result["847330"];
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].effective_year, 2000);
        assert_eq!(first[1].ad_valorem_percent, 12.5);
        assert_eq!(first[0].origin, "004");
        assert_eq!(first[0].destination, "840");
        assert!((first[0].ad_valorem_rate() - 0.10).abs() < 1e-12);

        assert_eq!(result["851712"].len(), 1);
    }

    #[test]
    fn test_bad_observation_does_not_poison_siblings() {
        let payload = document(&[series(
            Some("847330"),
            &[("2000", "10"), ("20x1", "11"), ("2002", "n/a"), ("2003", "9")],
        )]);

        let result = extract(&payload, "004", "840").unwrap();
        let years: Vec<i32> = result["847330"].iter().map(|o| o.effective_year).collect();
        assert_eq!(years, vec![2000, 2003]);
    }

    #[test]
    fn test_series_without_product_is_skipped() {
        let payload = document(&[
            series(None, &[("2000", "10")]),
            series(Some("854231"), &[("2000", "3")]),
        ]);
        let result = extract(&payload, "004", "840").unwrap();
        assert_eq!(result.keys().collect::<Vec<_>>(), vec!["854231"]);
    }

    #[test]
    fn test_no_series_is_empty_not_error() {
        let result = extract(&document(&[]), "004", "840").unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_malformed_document_is_error() {
        assert!(extract(b"<not-closed>", "004", "840").is_err());
        assert!(extract(&[0xff, 0xfe, 0x00], "004", "840").is_err());
    }

    #[test]
    fn test_stage_executes_extract() {
        let payload = FetchedPayload {
            pair: CountryPair::new("004", "840"),
            body: document(&[series(Some("847330"), &[("2000", "10")])]),
        };
        let result = SdmxExtractor.execute(payload).unwrap();
        assert_eq!(result["847330"].len(), 1);
        assert_eq!(SdmxExtractor.stage_name(), "sdmx_extract");
    }

    const CODELIST: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<message:Structure xmlns:message="http://www.sdmx.org/resources/sdmxml/schemas/v2_1/message"
    xmlns:structure="http://www.sdmx.org/resources/sdmxml/schemas/v2_1/structure"
    xmlns:common="http://www.sdmx.org/resources/sdmxml/schemas/v2_1/common">
  <message:Structures>
    <structure:Codelists>
      <structure:Codelist id="CL_PRODUCTCODE_WITS">
        <structure:Code id="847330"><common:Name>Parts</common:Name></structure:Code>
      </structure:Codelist>
      <structure:Codelist id="CL_COUNTRY_WITS">
        <structure:Code id="000"><common:Name xml:lang="en">World</common:Name></structure:Code>
        <structure:Code id="004"><common:Name xml:lang="en">Afghanistan</common:Name></structure:Code>
        <structure:Code id="EUN"><common:Name xml:lang="en">European Union</common:Name></structure:Code>
        <structure:Code id="840"/>
      </structure:Codelist>
    </structure:Codelists>
  </message:Structures>
</message:Structure>"#;

    #[test]
    fn test_country_codes_keep_numeric_only() {
        let countries = parse_country_codes(CODELIST.as_bytes()).unwrap();
        assert_eq!(countries.len(), 3);
        assert_eq!(countries["004"], "Afghanistan");
        assert_eq!(countries["000"], "World");
        assert_eq!(countries["840"], "Unknown");
        assert!(!countries.contains_key("EUN"));
        assert!(!countries.contains_key("847330"));
    }

    #[test]
    fn test_missing_codelist_is_empty() {
        let payload = r#"<root xmlns:structure="http://www.sdmx.org/resources/sdmxml/schemas/v2_1/structure"/>"#;
        assert!(parse_country_codes(payload.as_bytes()).unwrap().is_empty());
    }
}
