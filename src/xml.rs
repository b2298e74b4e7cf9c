//! 3GPP XML translator boundary.
//!
//! The protocol engine only needs two operations: turn an unsolicited
//! +CPOSR payload into a request record, and render a response record as
//! the +CPOS body. [`XmlTranslator`] is that boundary; [`GppXmlCodec`] is a
//! deliberately small implementation covering the `pos_meas` request subset
//! (27.007 element names) and the `location` response. Assist-data payloads
//! are recognized but not decoded field-by-field.

use crate::records::{
    MethodType, MultSets, PosMeas, RequestKind, RequestRecord, ResponseKind, ResponseRecord,
    RrcMeas, RrcMethod, RrlpMeas, RrlpMethod, ShapeData,
};

#[derive(Debug, PartialEq)]
pub enum TranslateError {
    NotUtf8,
    MissingElement(&'static str),
    Unsupported,
}

impl std::fmt::Display for TranslateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranslateError::NotUtf8 => write!(f, "payload is not valid utf-8"),
            TranslateError::MissingElement(name) => write!(f, "missing element <{}>", name),
            TranslateError::Unsupported => write!(f, "unsupported document"),
        }
    }
}

impl std::error::Error for TranslateError {}

pub trait XmlTranslator: Send + Sync {
    fn parse_unsolicited(&self, xml: &[u8]) -> Result<RequestRecord, TranslateError>;
    fn render_response(&self, resp: &ResponseRecord) -> Result<Vec<u8>, TranslateError>;
}

/*
 * Tiny element scanner. Enough for the fixed, machine-generated documents
 * the modem emits; not a general XML parser.
 */

/// Locate the opening tag of `name`, rejecting partial tag-name matches
/// (`<pos_meas>` is not a hit for `pos`). Returns the span of the tag from
/// `<` up to (not including) its `>`.
fn find_tag(xml: &str, name: &str) -> Option<(usize, usize)> {
    let open = format!("<{}", name);
    let mut base = 0;
    loop {
        let start = xml[base..].find(&open)? + base;
        let after = start + open.len();
        match xml.as_bytes().get(after).copied() {
            Some(b'>') | Some(b' ') | Some(b'/') | Some(b'\t') | Some(b'\r') | Some(b'\n') => {
                let tag_end = xml[after..].find('>')? + after;
                return Some((start, tag_end));
            }
            _ => base = after,
        }
    }
}

/// Inner text of the first `<name ...>...</name>` element; a self-closing
/// `<name/>` yields an empty string.
fn element<'a>(xml: &'a str, name: &str) -> Option<&'a str> {
    let (_, tag_end) = find_tag(xml, name)?;
    if xml.as_bytes()[tag_end - 1] == b'/' {
        return Some("");
    }
    let close = format!("</{}>", name);
    let body_start = tag_end + 1;
    let body_end = xml[body_start..].find(&close)? + body_start;
    Some(&xml[body_start..body_end])
}

/// Value of `attr` on the first `<name ...>` tag.
fn attribute<'a>(xml: &'a str, name: &str, attr: &str) -> Option<&'a str> {
    let (start, tag_end) = find_tag(xml, name)?;
    let tag = &xml[start..tag_end];
    let key = format!("{}=\"", attr);
    let v = tag.find(&key)? + key.len();
    let rest = &tag[v..];
    let end = rest.find('"')?;
    Some(&rest[..end])
}

fn int_text(xml: &str, name: &str) -> Option<i32> {
    element(xml, name)?.trim().parse().ok()
}

pub struct GppXmlCodec;

impl GppXmlCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GppXmlCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_rrlp(rrlp: &str) -> Result<PosMeas, TranslateError> {
    let instruct = element(rrlp, "RRLP_pos_instruct")
        .ok_or(TranslateError::MissingElement("RRLP_pos_instruct"))?;

    let method_type_body = element(instruct, "RRLP_method_type").unwrap_or("");
    let (method_type, accuracy_scope) = if element(method_type_body, "ms_assisted_no_accuracy").is_some() {
        (MethodType::MsAssistedNoAccuracy, "")
    } else if let Some(body) = element(method_type_body, "ms_based")
        .or_else(|| element(method_type_body, "ms_based_pref"))
        .or_else(|| element(method_type_body, "ue_based"))
    {
        (MethodType::MsBased, body)
    } else if let Some(body) = element(method_type_body, "ms_assisted")
        .or_else(|| element(method_type_body, "ms_assisted_pref"))
        .or_else(|| element(method_type_body, "ue_assisted"))
    {
        (MethodType::MsAssisted, body)
    } else {
        (MethodType::None, "")
    };
    let accuracy = int_text(accuracy_scope, "method_accuracy").unwrap_or(0);

    let method = match attribute(instruct, "RRLP_method", "literal") {
        Some("gps") => RrlpMethod::Gps,
        _ => RrlpMethod::None,
    };
    let resp_time_seconds = int_text(instruct, "resp_time_seconds").unwrap_or(0);
    let mult_sets = match attribute(instruct, "mult_sets", "literal") {
        Some("multiple") => MultSets::Multiple,
        Some("one") => MultSets::One,
        _ => MultSets::None,
    };

    Ok(PosMeas::Rrlp(RrlpMeas {
        method_type,
        accuracy,
        method,
        resp_time_seconds,
        mult_sets,
    }))
}

fn parse_rrc(rrc: &str) -> Result<PosMeas, TranslateError> {
    let method = match attribute(rrc, "rep_quant", "rrc_method") {
        Some("gps") => RrcMethod::Gps,
        Some("otdoa") => RrcMethod::Otdoa,
        Some("otdoaOrGPS") => RrcMethod::OtdoaOrGps,
        Some("cellID") => RrcMethod::CellId,
        _ => RrcMethod::None,
    };
    let hor_accuracy = attribute(rrc, "rep_quant", "hor_acc")
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);
    let rep_amount = attribute(rrc, "period_rep_crit", "rep_amount")
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);
    let rep_interval_seconds = attribute(rrc, "period_rep_crit", "rep_interval_long")
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(0);
    Ok(PosMeas::Rrc(RrcMeas {
        method,
        hor_accuracy,
        rep_amount,
        rep_interval_seconds,
    }))
}

impl XmlTranslator for GppXmlCodec {
    fn parse_unsolicited(&self, xml: &[u8]) -> Result<RequestRecord, TranslateError> {
        let text = std::str::from_utf8(xml).map_err(|_| TranslateError::NotUtf8)?;
        let pos = element(text, "pos").ok_or(TranslateError::MissingElement("pos"))?;

        if let Some(pos_meas) = element(pos, "pos_meas") {
            let meas = if element(pos_meas, "meas_abort").is_some() {
                PosMeas::Abort
            } else if let Some(rrlp) = element(pos_meas, "RRLP_meas") {
                parse_rrlp(rrlp)?
            } else if let Some(rrc) = element(pos_meas, "RRC_meas") {
                parse_rrc(rrc)?
            } else {
                return Err(TranslateError::Unsupported);
            };
            return Ok(RequestRecord::new_pos_meas(meas));
        }

        if element(pos, "assist_data").is_some() {
            let mut req = RequestRecord::default();
            req.version = crate::records::MSG_VERSION;
            req.kind = RequestKind::AssistData;
            return Ok(req);
        }

        // location / GPS_meas / GPS_assist_req / msg / pos_err arrive on
        // this channel in principle but are not decoded here
        Err(TranslateError::Unsupported)
    }

    fn render_response(&self, resp: &ResponseRecord) -> Result<Vec<u8>, TranslateError> {
        if !matches!(resp.kind, ResponseKind::Location | ResponseKind::GpsMeas) {
            return Err(TranslateError::Unsupported);
        }
        let mut out = String::with_capacity(512);
        out.push_str("<?xml version=\"1.0\"?>\n<pos>\n <location>\n  <location_parameters>\n");
        render_shape(&mut out, &resp.location.parameters.shape);
        if let Some(v) = resp.location.parameters.velocity {
            out.push_str("   <velocity>\n    <hor_velocity>\n");
            push_tag(&mut out, 5, "bearing", &v.vert_velocity_direction.to_string());
            push_tag(&mut out, 5, "horspeed", &v.hor_velocity.to_string());
            out.push_str("    </hor_velocity>\n   </velocity>\n");
        }
        out.push_str("  </location_parameters>\n");
        push_tag(&mut out, 2, "time_of_fix", &resp.location.time_of_fix.to_string());
        out.push_str(" </location>\n</pos>\n");
        Ok(out.into_bytes())
    }
}

fn push_tag(out: &mut String, indent: usize, name: &str, value: &str) {
    for _ in 0..indent {
        out.push(' ');
    }
    out.push('<');
    out.push_str(name);
    out.push('>');
    out.push_str(value);
    out.push_str("</");
    out.push_str(name);
    out.push_str(">\n");
}

fn push_coordinate(out: &mut String, coord: &crate::records::Coordinate) {
    out.push_str("    <coordinate>\n     <latitude>\n");
    push_tag(out, 6, "north", if coord.latitude.north { "1" } else { "0" });
    push_tag(out, 6, "degrees", &format!("{}", coord.latitude.degrees));
    out.push_str("     </latitude>\n");
    push_tag(out, 5, "longitude", &format!("{}", coord.longitude));
    out.push_str("    </coordinate>\n");
}

fn render_shape(out: &mut String, shape: &ShapeData) {
    out.push_str("   <shape_data>\n");
    match shape {
        ShapeData::PointAltUncertEllipse {
            coord,
            altitude,
            uncert_semi_major,
            uncert_semi_minor,
            orient_major,
            confidence,
            uncert_alt,
        } => {
            out.push_str("   <ellipsoid_point_alt_uncertellipse>\n");
            push_coordinate(out, coord);
            out.push_str("    <altitude>\n");
            push_tag(out, 5, "height_above_surface", if altitude.above_surface { "1" } else { "0" });
            push_tag(out, 5, "height", &altitude.height.to_string());
            out.push_str("    </altitude>\n");
            push_tag(out, 4, "uncert_semi_major", &uncert_semi_major.to_string());
            push_tag(out, 4, "uncert_semi_minor", &uncert_semi_minor.to_string());
            push_tag(out, 4, "orient_major", &orient_major.to_string());
            push_tag(out, 4, "confidence", &confidence.to_string());
            push_tag(out, 4, "uncert_alt", &uncert_alt.to_string());
            out.push_str("   </ellipsoid_point_alt_uncertellipse>\n");
        }
        ShapeData::PointUncertCircle { coord, uncert_circle } => {
            out.push_str("   <ellipsoid_point_uncert_circle>\n");
            push_coordinate(out, coord);
            push_tag(out, 4, "uncert_circle", &uncert_circle.to_string());
            out.push_str("   </ellipsoid_point_uncert_circle>\n");
        }
        ShapeData::Point { coord } => {
            out.push_str("   <ellipsoid_point>\n");
            push_coordinate(out, coord);
            out.push_str("   </ellipsoid_point>\n");
        }
        // remaining shapes degrade to their coordinate, if any
        ShapeData::PointUncertEllipse { coord, .. }
        | ShapeData::PointAlt { coord, .. }
        | ShapeData::Arc { coord, .. } => {
            out.push_str("   <ellipsoid_point>\n");
            push_coordinate(out, coord);
            out.push_str("   </ellipsoid_point>\n");
        }
        ShapeData::Polygon(points) => {
            out.push_str("   <polygon>\n");
            for p in points {
                push_coordinate(out, p);
            }
            out.push_str("   </polygon>\n");
        }
        ShapeData::None => {}
    }
    out.push_str("   </shape_data>\n");
}
