//! Position request/response records and their fixed-size wire encoding.
//!
//! These are the structured payloads exchanged with the positioning process
//! inside the framed channel (see `gpslink::wire`). Both ends must agree on
//! [`MSG_VERSION`]; a mismatch forces the decoded record into the error
//! state instead of a partial interpretation.
//!
//! Integers and doubles are written in host byte order, matching the wire
//! peers this daemon has always talked to. Both endpoints must run on the
//! same architecture.

use crate::common::monotime;

/// Bump when a record structure or its wire size changes.
pub const MSG_VERSION: i32 = 1;

/// 3GPP polygon shapes carry at most 15 points.
pub const MAX_POLYGON_POINTS: usize = 15;

pub const REQUEST_WIRE_SIZE: usize = 124;
pub const RESPONSE_WIRE_SIZE: usize = 392;

#[derive(Debug, PartialEq)]
pub enum CodecError {
    Truncated { expected: usize, got: usize },
    BadTag { field: &'static str, value: i32 },
    VersionMismatch { expected: i32, got: i32 },
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::Truncated { expected, got } => {
                write!(f, "payload size mismatch (expected {}, got {})", expected, got)
            }
            CodecError::BadTag { field, value } => {
                write!(f, "invalid tag {} for {}", value, field)
            }
            CodecError::VersionMismatch { expected, got } => {
                write!(f, "message version mismatch (expected {}, got {})", expected, got)
            }
        }
    }
}

impl std::error::Error for CodecError {}

/*
 * Request side
 */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MethodType {
    #[default]
    None,
    MsBased,
    MsAssisted,
    MsAssistedNoAccuracy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MultSets {
    #[default]
    None,
    Multiple,
    One,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RrlpMethod {
    #[default]
    None,
    Gps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RrcMethod {
    #[default]
    None,
    Otdoa,
    Gps,
    OtdoaOrGps,
    CellId,
}

/// One-shot RRLP measurement request parameters.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RrlpMeas {
    pub method_type: MethodType,
    pub accuracy: i32,
    pub method: RrlpMethod,
    pub resp_time_seconds: i32,
    pub mult_sets: MultSets,
}

/// Periodic RRC measurement request parameters. `rep_amount == 0` means
/// "report until explicitly stopped".
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RrcMeas {
    pub method: RrcMethod,
    pub hor_accuracy: i32,
    pub rep_amount: i32,
    pub rep_interval_seconds: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum PosMeas {
    #[default]
    None,
    Rrlp(RrlpMeas),
    Rrc(RrcMeas),
    Abort,
    StopGps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestKind {
    #[default]
    None,
    Location,
    AssistData,
    PosMeas,
    GpsMeas,
    GpsAssistReq,
    ControlMsg,
    PosError,
    /// Decode failure / version mismatch; never acted on as a request.
    Error,
}

/// Monotonic timestamps tracking one request's lifetime. Zero = never.
/// `stop_sent_at` and `response_sent_to_modem_at` are only meaningful
/// relative to `received_at`; a later `received_at` invalidates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestStatus {
    pub received_at: u64,
    pub response_from_gps_at: u64,
    pub response_sent_to_modem_at: u64,
    pub stop_sent_at: u64,
    pub responses_sent: u32,
}

/// Timing breadcrumbs carried across the wire for TTFF diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DebugStats {
    pub requested_by_network_at: u64,
    pub requested_from_gps_at: u64,
    pub first_response_from_gps_at: u64,
    pub response_from_gps_at: u64,
    pub request_id: u32,
    pub abort_id: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RequestRecord {
    pub version: i32,
    pub kind: RequestKind,
    pub pos_meas: PosMeas,
    pub status: RequestStatus,
    pub dbg: DebugStats,
}

impl RequestRecord {
    /// Record representing an undecodable/incompatible payload.
    pub fn error() -> Self {
        Self {
            version: MSG_VERSION,
            kind: RequestKind::Error,
            ..Self::default()
        }
    }

    /// Fresh position-measurement request, stamped as received now.
    pub fn new_pos_meas(pos_meas: PosMeas) -> Self {
        Self {
            version: MSG_VERSION,
            kind: RequestKind::PosMeas,
            pos_meas,
            status: RequestStatus {
                received_at: monotime::msec_now(),
                ..RequestStatus::default()
            },
            ..Self::default()
        }
    }

    pub fn is_pos_meas(&self) -> bool {
        self.kind == RequestKind::PosMeas
            && matches!(self.pos_meas, PosMeas::Rrlp(_) | PosMeas::Rrc(_))
    }

    // Derived request summary.

    pub fn method_type(&self) -> MethodType {
        match self.pos_meas {
            PosMeas::Rrlp(m) => m.method_type,
            // RRC carries only the reporting method; MS-assisted is implied
            // for GPS-capable methods.
            PosMeas::Rrc(m) if m.method != RrcMethod::None => MethodType::MsAssisted,
            _ => MethodType::None,
        }
    }

    pub fn requested_count(&self) -> Option<u32> {
        match self.pos_meas {
            PosMeas::Rrc(m) => Some(m.rep_amount.max(0) as u32),
            _ => None,
        }
    }

    pub fn interval_seconds(&self) -> Option<u32> {
        match self.pos_meas {
            PosMeas::Rrc(m) => Some(m.rep_interval_seconds.max(0) as u32),
            _ => None,
        }
    }

    pub fn required_accuracy(&self) -> Option<i32> {
        match self.pos_meas {
            PosMeas::Rrlp(m) => Some(m.accuracy),
            PosMeas::Rrc(m) => Some(m.hor_accuracy),
            _ => None,
        }
    }
}

/*
 * Response side
 */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseKind {
    #[default]
    None,
    Location,
    GpsMeas,
    GpsAssistReq,
    PosError,
    /// Decode failure / version mismatch.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Latitude {
    pub north: bool,
    pub degrees: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Coordinate {
    pub latitude: Latitude,
    pub longitude: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Altitude {
    pub above_surface: bool,
    pub height: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Velocity {
    pub hor_velocity: i32,
    pub vert_velocity: i32,
    pub vert_velocity_direction: i32,
    pub hor_uncert: i32,
    pub vert_uncert: i32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub enum ShapeData {
    #[default]
    None,
    Point {
        coord: Coordinate,
    },
    PointUncertCircle {
        coord: Coordinate,
        uncert_circle: i32,
    },
    PointUncertEllipse {
        coord: Coordinate,
        uncert_semi_major: i32,
        uncert_semi_minor: i32,
        orient_major: i32,
        confidence: i32,
    },
    PointAlt {
        coord: Coordinate,
        altitude: Altitude,
    },
    PointAltUncertEllipse {
        coord: Coordinate,
        altitude: Altitude,
        uncert_semi_major: i32,
        uncert_semi_minor: i32,
        orient_major: i32,
        confidence: i32,
        uncert_alt: i32,
    },
    /// Bounded at [`MAX_POLYGON_POINTS`]; excess vertices are dropped at
    /// encode time.
    Polygon(Vec<Coordinate>),
    Arc {
        coord: Coordinate,
        inner_rad: i32,
        uncert_rad: i32,
        offset_angle: i32,
        included_angle: i32,
        confidence: i32,
    },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LocationParameters {
    pub time: i32,
    pub direction: i32,
    pub shape: ShapeData,
    pub velocity: Option<Velocity>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Location {
    pub parameters: LocationParameters,
    pub time_of_fix: i32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResponseRecord {
    pub version: i32,
    pub kind: ResponseKind,
    pub location: Location,
    pub dbg: DebugStats,
}

impl ResponseRecord {
    pub fn error() -> Self {
        Self {
            version: MSG_VERSION,
            kind: ResponseKind::Error,
            ..Self::default()
        }
    }
}

/*
 * Wire codec. Every record encodes to a fixed byte count; unions encode the
 * active variant into a zero-padded block sized for the largest member.
 */

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn with_capacity(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    fn put_f64(&mut self, v: f64) {
        self.buf.extend_from_slice(&v.to_ne_bytes());
    }

    /// Zero-fill up to an absolute offset (end of a fixed union block).
    fn pad_to(&mut self, offset: usize) {
        debug_assert!(self.buf.len() <= offset);
        self.buf.resize(offset, 0);
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + n > self.data.len() {
            return Err(CodecError::Truncated {
                expected: self.pos + n,
                got: self.data.len(),
            });
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn get_i32(&mut self) -> Result<i32, CodecError> {
        Ok(i32::from_ne_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn get_u32(&mut self) -> Result<u32, CodecError> {
        Ok(u32::from_ne_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn get_u64(&mut self) -> Result<u64, CodecError> {
        Ok(u64::from_ne_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn get_f64(&mut self) -> Result<f64, CodecError> {
        Ok(f64::from_ne_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn seek(&mut self, offset: usize) {
        self.pos = offset;
    }
}

fn request_kind_tag(kind: RequestKind) -> i32 {
    match kind {
        RequestKind::None => 0,
        RequestKind::Location => 1,
        RequestKind::AssistData => 2,
        RequestKind::PosMeas => 3,
        RequestKind::GpsMeas => 4,
        RequestKind::GpsAssistReq => 5,
        RequestKind::ControlMsg => 6,
        RequestKind::PosError => 7,
        RequestKind::Error => -1,
    }
}

fn request_kind_from_tag(tag: i32) -> Result<RequestKind, CodecError> {
    Ok(match tag {
        0 => RequestKind::None,
        1 => RequestKind::Location,
        2 => RequestKind::AssistData,
        3 => RequestKind::PosMeas,
        4 => RequestKind::GpsMeas,
        5 => RequestKind::GpsAssistReq,
        6 => RequestKind::ControlMsg,
        7 => RequestKind::PosError,
        -1 => RequestKind::Error,
        other => return Err(CodecError::BadTag { field: "request kind", value: other }),
    })
}

fn response_kind_tag(kind: ResponseKind) -> i32 {
    match kind {
        ResponseKind::None => 0,
        ResponseKind::Location => 1,
        ResponseKind::GpsMeas => 2,
        ResponseKind::GpsAssistReq => 3,
        ResponseKind::PosError => 4,
        ResponseKind::Error => -1,
    }
}

fn response_kind_from_tag(tag: i32) -> Result<ResponseKind, CodecError> {
    Ok(match tag {
        0 => ResponseKind::None,
        1 => ResponseKind::Location,
        2 => ResponseKind::GpsMeas,
        3 => ResponseKind::GpsAssistReq,
        4 => ResponseKind::PosError,
        -1 => ResponseKind::Error,
        other => return Err(CodecError::BadTag { field: "response kind", value: other }),
    })
}

fn put_status(w: &mut Writer, s: &RequestStatus) {
    w.put_u64(s.received_at);
    w.put_u64(s.response_from_gps_at);
    w.put_u64(s.response_sent_to_modem_at);
    w.put_u64(s.stop_sent_at);
    w.put_u32(s.responses_sent);
}

fn get_status(r: &mut Reader) -> Result<RequestStatus, CodecError> {
    Ok(RequestStatus {
        received_at: r.get_u64()?,
        response_from_gps_at: r.get_u64()?,
        response_sent_to_modem_at: r.get_u64()?,
        stop_sent_at: r.get_u64()?,
        responses_sent: r.get_u32()?,
    })
}

fn put_dbg(w: &mut Writer, d: &DebugStats) {
    w.put_u64(d.requested_by_network_at);
    w.put_u64(d.requested_from_gps_at);
    w.put_u64(d.first_response_from_gps_at);
    w.put_u64(d.response_from_gps_at);
    w.put_u32(d.request_id);
    w.put_u32(d.abort_id);
}

fn get_dbg(r: &mut Reader) -> Result<DebugStats, CodecError> {
    Ok(DebugStats {
        requested_by_network_at: r.get_u64()?,
        requested_from_gps_at: r.get_u64()?,
        first_response_from_gps_at: r.get_u64()?,
        response_from_gps_at: r.get_u64()?,
        request_id: r.get_u32()?,
        abort_id: r.get_u32()?,
    })
}

pub fn encode_request(req: &RequestRecord) -> Vec<u8> {
    let mut w = Writer::with_capacity(REQUEST_WIRE_SIZE);
    w.put_i32(req.version);
    w.put_i32(request_kind_tag(req.kind));
    let (tag, rrlp, rrc) = match req.pos_meas {
        PosMeas::None => (0, RrlpMeas::default(), RrcMeas::default()),
        PosMeas::Rrlp(m) => (1, m, RrcMeas::default()),
        PosMeas::Rrc(m) => (2, RrlpMeas::default(), m),
        PosMeas::Abort => (3, RrlpMeas::default(), RrcMeas::default()),
        PosMeas::StopGps => (4, RrlpMeas::default(), RrcMeas::default()),
    };
    w.put_i32(tag);
    w.put_i32(rrlp.method_type as i32);
    w.put_i32(rrlp.accuracy);
    w.put_i32(rrlp.method as i32);
    w.put_i32(rrlp.resp_time_seconds);
    w.put_i32(rrlp.mult_sets as i32);
    w.put_i32(rrc.method as i32);
    w.put_i32(rrc.hor_accuracy);
    w.put_i32(rrc.rep_amount);
    w.put_i32(rrc.rep_interval_seconds);
    put_status(&mut w, &req.status);
    put_dbg(&mut w, &req.dbg);
    debug_assert_eq!(w.buf.len(), REQUEST_WIRE_SIZE);
    w.buf
}

pub fn decode_request(payload: &[u8]) -> Result<RequestRecord, CodecError> {
    if payload.len() != REQUEST_WIRE_SIZE {
        return Err(CodecError::Truncated {
            expected: REQUEST_WIRE_SIZE,
            got: payload.len(),
        });
    }
    let mut r = Reader::new(payload);
    let version = r.get_i32()?;
    if version != MSG_VERSION {
        return Err(CodecError::VersionMismatch {
            expected: MSG_VERSION,
            got: version,
        });
    }
    let kind = request_kind_from_tag(r.get_i32()?)?;
    let pos_tag = r.get_i32()?;
    let rrlp = RrlpMeas {
        method_type: method_type_from_tag(r.get_i32()?)?,
        accuracy: r.get_i32()?,
        method: rrlp_method_from_tag(r.get_i32()?)?,
        resp_time_seconds: r.get_i32()?,
        mult_sets: mult_sets_from_tag(r.get_i32()?)?,
    };
    let rrc = RrcMeas {
        method: rrc_method_from_tag(r.get_i32()?)?,
        hor_accuracy: r.get_i32()?,
        rep_amount: r.get_i32()?,
        rep_interval_seconds: r.get_i32()?,
    };
    let pos_meas = match pos_tag {
        0 => PosMeas::None,
        1 => PosMeas::Rrlp(rrlp),
        2 => PosMeas::Rrc(rrc),
        3 => PosMeas::Abort,
        4 => PosMeas::StopGps,
        other => return Err(CodecError::BadTag { field: "pos_meas", value: other }),
    };
    let status = get_status(&mut r)?;
    let dbg = get_dbg(&mut r)?;
    Ok(RequestRecord {
        version,
        kind,
        pos_meas,
        status,
        dbg,
    })
}

fn method_type_from_tag(v: i32) -> Result<MethodType, CodecError> {
    Ok(match v {
        0 => MethodType::None,
        1 => MethodType::MsBased,
        2 => MethodType::MsAssisted,
        3 => MethodType::MsAssistedNoAccuracy,
        other => return Err(CodecError::BadTag { field: "method_type", value: other }),
    })
}

fn mult_sets_from_tag(v: i32) -> Result<MultSets, CodecError> {
    Ok(match v {
        0 => MultSets::None,
        1 => MultSets::Multiple,
        2 => MultSets::One,
        other => return Err(CodecError::BadTag { field: "mult_sets", value: other }),
    })
}

fn rrlp_method_from_tag(v: i32) -> Result<RrlpMethod, CodecError> {
    Ok(match v {
        0 => RrlpMethod::None,
        1 => RrlpMethod::Gps,
        other => return Err(CodecError::BadTag { field: "rrlp_method", value: other }),
    })
}

fn rrc_method_from_tag(v: i32) -> Result<RrcMethod, CodecError> {
    Ok(match v {
        0 => RrcMethod::None,
        1 => RrcMethod::Otdoa,
        2 => RrcMethod::Gps,
        3 => RrcMethod::OtdoaOrGps,
        4 => RrcMethod::CellId,
        other => return Err(CodecError::BadTag { field: "rrc_method", value: other }),
    })
}

// Shape union block: i32 tag + body sized for the largest variant
// (polygon: i32 count + 15 coordinates at 20 bytes each).
const COORD_SIZE: usize = 4 + 8 + 8;
const SHAPE_BODY_SIZE: usize = 4 + MAX_POLYGON_POINTS * COORD_SIZE;

fn put_coord(w: &mut Writer, c: &Coordinate) {
    w.put_i32(c.latitude.north as i32);
    w.put_f64(c.latitude.degrees);
    w.put_f64(c.longitude);
}

fn get_coord(r: &mut Reader) -> Result<Coordinate, CodecError> {
    Ok(Coordinate {
        latitude: Latitude {
            north: r.get_i32()? != 0,
            degrees: r.get_f64()?,
        },
        longitude: r.get_f64()?,
    })
}

fn put_altitude(w: &mut Writer, a: &Altitude) {
    w.put_i32(a.above_surface as i32);
    w.put_i32(a.height);
}

fn get_altitude(r: &mut Reader) -> Result<Altitude, CodecError> {
    Ok(Altitude {
        above_surface: r.get_i32()? != 0,
        height: r.get_i32()?,
    })
}

fn put_shape(w: &mut Writer, shape: &ShapeData) {
    let body_start = w.buf.len() + 4;
    match shape {
        ShapeData::None => w.put_i32(0),
        ShapeData::Point { coord } => {
            w.put_i32(1);
            put_coord(w, coord);
        }
        ShapeData::PointUncertCircle { coord, uncert_circle } => {
            w.put_i32(2);
            put_coord(w, coord);
            w.put_i32(*uncert_circle);
        }
        ShapeData::PointUncertEllipse {
            coord,
            uncert_semi_major,
            uncert_semi_minor,
            orient_major,
            confidence,
        } => {
            w.put_i32(3);
            put_coord(w, coord);
            w.put_i32(*uncert_semi_major);
            w.put_i32(*uncert_semi_minor);
            w.put_i32(*orient_major);
            w.put_i32(*confidence);
        }
        ShapeData::PointAlt { coord, altitude } => {
            w.put_i32(4);
            put_coord(w, coord);
            put_altitude(w, altitude);
        }
        ShapeData::PointAltUncertEllipse {
            coord,
            altitude,
            uncert_semi_major,
            uncert_semi_minor,
            orient_major,
            confidence,
            uncert_alt,
        } => {
            w.put_i32(5);
            put_coord(w, coord);
            put_altitude(w, altitude);
            w.put_i32(*uncert_semi_major);
            w.put_i32(*uncert_semi_minor);
            w.put_i32(*orient_major);
            w.put_i32(*confidence);
            w.put_i32(*uncert_alt);
        }
        ShapeData::Polygon(points) => {
            w.put_i32(6);
            let n = points.len().min(MAX_POLYGON_POINTS);
            w.put_i32(n as i32);
            for p in &points[..n] {
                put_coord(w, p);
            }
        }
        ShapeData::Arc {
            coord,
            inner_rad,
            uncert_rad,
            offset_angle,
            included_angle,
            confidence,
        } => {
            w.put_i32(7);
            put_coord(w, coord);
            w.put_i32(*inner_rad);
            w.put_i32(*uncert_rad);
            w.put_i32(*offset_angle);
            w.put_i32(*included_angle);
            w.put_i32(*confidence);
        }
    }
    w.pad_to(body_start + SHAPE_BODY_SIZE);
}

fn get_shape(r: &mut Reader) -> Result<ShapeData, CodecError> {
    let body_start = r.pos + 4;
    let tag = r.get_i32()?;
    let shape = match tag {
        0 => ShapeData::None,
        1 => ShapeData::Point { coord: get_coord(r)? },
        2 => ShapeData::PointUncertCircle {
            coord: get_coord(r)?,
            uncert_circle: r.get_i32()?,
        },
        3 => ShapeData::PointUncertEllipse {
            coord: get_coord(r)?,
            uncert_semi_major: r.get_i32()?,
            uncert_semi_minor: r.get_i32()?,
            orient_major: r.get_i32()?,
            confidence: r.get_i32()?,
        },
        4 => ShapeData::PointAlt {
            coord: get_coord(r)?,
            altitude: get_altitude(r)?,
        },
        5 => ShapeData::PointAltUncertEllipse {
            coord: get_coord(r)?,
            altitude: get_altitude(r)?,
            uncert_semi_major: r.get_i32()?,
            uncert_semi_minor: r.get_i32()?,
            orient_major: r.get_i32()?,
            confidence: r.get_i32()?,
            uncert_alt: r.get_i32()?,
        },
        6 => {
            let n = r.get_i32()?;
            if n < 0 || n as usize > MAX_POLYGON_POINTS {
                return Err(CodecError::BadTag { field: "polygon count", value: n });
            }
            let mut points = Vec::with_capacity(n as usize);
            for _ in 0..n {
                points.push(get_coord(r)?);
            }
            ShapeData::Polygon(points)
        }
        7 => ShapeData::Arc {
            coord: get_coord(r)?,
            inner_rad: r.get_i32()?,
            uncert_rad: r.get_i32()?,
            offset_angle: r.get_i32()?,
            included_angle: r.get_i32()?,
            confidence: r.get_i32()?,
        },
        other => return Err(CodecError::BadTag { field: "shape", value: other }),
    };
    r.seek(body_start + SHAPE_BODY_SIZE);
    Ok(shape)
}

pub fn encode_response(resp: &ResponseRecord) -> Vec<u8> {
    let mut w = Writer::with_capacity(RESPONSE_WIRE_SIZE);
    w.put_i32(resp.version);
    w.put_i32(response_kind_tag(resp.kind));
    w.put_i32(resp.location.time_of_fix);
    w.put_i32(resp.location.parameters.time);
    w.put_i32(resp.location.parameters.direction);
    put_shape(&mut w, &resp.location.parameters.shape);
    let vel = resp.location.parameters.velocity;
    w.put_i32(vel.is_some() as i32);
    let v = vel.unwrap_or_default();
    w.put_i32(v.hor_velocity);
    w.put_i32(v.vert_velocity);
    w.put_i32(v.vert_velocity_direction);
    w.put_i32(v.hor_uncert);
    w.put_i32(v.vert_uncert);
    put_dbg(&mut w, &resp.dbg);
    debug_assert_eq!(w.buf.len(), RESPONSE_WIRE_SIZE);
    w.buf
}

pub fn decode_response(payload: &[u8]) -> Result<ResponseRecord, CodecError> {
    if payload.len() != RESPONSE_WIRE_SIZE {
        return Err(CodecError::Truncated {
            expected: RESPONSE_WIRE_SIZE,
            got: payload.len(),
        });
    }
    let mut r = Reader::new(payload);
    let version = r.get_i32()?;
    if version != MSG_VERSION {
        return Err(CodecError::VersionMismatch {
            expected: MSG_VERSION,
            got: version,
        });
    }
    let kind = response_kind_from_tag(r.get_i32()?)?;
    let time_of_fix = r.get_i32()?;
    let time = r.get_i32()?;
    let direction = r.get_i32()?;
    let shape = get_shape(&mut r)?;
    let has_velocity = r.get_i32()? != 0;
    let v = Velocity {
        hor_velocity: r.get_i32()?,
        vert_velocity: r.get_i32()?,
        vert_velocity_direction: r.get_i32()?,
        hor_uncert: r.get_i32()?,
        vert_uncert: r.get_i32()?,
    };
    let dbg = get_dbg(&mut r)?;
    Ok(ResponseRecord {
        version,
        kind,
        location: Location {
            parameters: LocationParameters {
                time,
                direction,
                shape,
                velocity: has_velocity.then_some(v),
            },
            time_of_fix,
        },
        dbg,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_rrc_request() -> RequestRecord {
        let mut req = RequestRecord::new_pos_meas(PosMeas::Rrc(RrcMeas {
            method: RrcMethod::Gps,
            hor_accuracy: 30,
            rep_amount: 3,
            rep_interval_seconds: 5,
        }));
        req.status.responses_sent = 2;
        req.dbg.request_id = 9;
        req
    }

    #[test]
    fn request_round_trip_bit_for_bit() {
        let req = sample_rrc_request();
        let bytes = encode_request(&req);
        assert_eq!(bytes.len(), REQUEST_WIRE_SIZE);
        let back = decode_request(&bytes).unwrap();
        assert_eq!(back, req);
        assert_eq!(encode_request(&back), bytes);
    }

    #[test]
    fn request_round_trip_minimal() {
        let req = RequestRecord {
            version: MSG_VERSION,
            ..RequestRecord::default()
        };
        let bytes = encode_request(&req);
        assert_eq!(decode_request(&bytes).unwrap(), req);
    }

    #[test]
    fn response_round_trip_max_shape() {
        let polygon: Vec<Coordinate> = (0..MAX_POLYGON_POINTS)
            .map(|i| Coordinate {
                latitude: Latitude {
                    north: i % 2 == 0,
                    degrees: 37.0 + i as f64 * 0.25,
                },
                longitude: -122.0 - i as f64,
            })
            .collect();
        let resp = ResponseRecord {
            version: MSG_VERSION,
            kind: ResponseKind::Location,
            location: Location {
                parameters: LocationParameters {
                    time: 12,
                    direction: 1,
                    shape: ShapeData::Polygon(polygon),
                    velocity: Some(Velocity {
                        hor_velocity: 7,
                        vert_velocity: -2,
                        vert_velocity_direction: 1,
                        hor_uncert: 3,
                        vert_uncert: 4,
                    }),
                },
                time_of_fix: 123_456,
            },
            dbg: DebugStats {
                requested_from_gps_at: 10,
                first_response_from_gps_at: 450,
                ..DebugStats::default()
            },
        };
        let bytes = encode_response(&resp);
        assert_eq!(bytes.len(), RESPONSE_WIRE_SIZE);
        let back = decode_response(&bytes).unwrap();
        assert_eq!(back, resp);
        assert_eq!(encode_response(&back), bytes);
    }

    #[test]
    fn response_round_trip_ellipse() {
        let resp = ResponseRecord {
            version: MSG_VERSION,
            kind: ResponseKind::Location,
            location: Location {
                parameters: LocationParameters {
                    shape: ShapeData::PointAltUncertEllipse {
                        coord: Coordinate {
                            latitude: Latitude { north: true, degrees: 37.12345 },
                            longitude: -122.12345,
                        },
                        altitude: Altitude { above_surface: true, height: 90 },
                        uncert_semi_major: 7,
                        uncert_semi_minor: 7,
                        orient_major: 0,
                        confidence: 100,
                        uncert_alt: 10,
                    },
                    ..LocationParameters::default()
                },
                time_of_fix: 1000,
            },
            ..ResponseRecord::default()
        };
        let back = decode_response(&encode_response(&resp)).unwrap();
        assert_eq!(back, resp);
    }

    #[test]
    fn version_mismatch_rejected() {
        let mut req = sample_rrc_request();
        req.version = MSG_VERSION + 1;
        let bytes = encode_request(&req);
        assert!(matches!(
            decode_request(&bytes),
            Err(CodecError::VersionMismatch { got, .. }) if got == MSG_VERSION + 1
        ));
    }

    #[test]
    fn size_mismatch_rejected() {
        let bytes = encode_request(&sample_rrc_request());
        assert!(matches!(
            decode_request(&bytes[..bytes.len() - 1]),
            Err(CodecError::Truncated { .. })
        ));
        let mut longer = bytes.clone();
        longer.push(0);
        assert!(decode_request(&longer).is_err());
    }

    #[test]
    fn polygon_bounded_at_encode() {
        let too_many: Vec<Coordinate> = (0..MAX_POLYGON_POINTS + 5)
            .map(|_| Coordinate::default())
            .collect();
        let resp = ResponseRecord {
            version: MSG_VERSION,
            kind: ResponseKind::Location,
            location: Location {
                parameters: LocationParameters {
                    shape: ShapeData::Polygon(too_many),
                    ..LocationParameters::default()
                },
                time_of_fix: 0,
            },
            ..ResponseRecord::default()
        };
        let back = decode_response(&encode_response(&resp)).unwrap();
        match back.location.parameters.shape {
            ShapeData::Polygon(p) => assert_eq!(p.len(), MAX_POLYGON_POINTS),
            other => panic!("unexpected shape {:?}", other),
        }
    }

    #[test]
    fn derived_summary() {
        let req = sample_rrc_request();
        assert_eq!(req.requested_count(), Some(3));
        assert_eq!(req.interval_seconds(), Some(5));
        assert_eq!(req.required_accuracy(), Some(30));
        assert!(req.is_pos_meas());
        assert!(!RequestRecord::error().is_pos_meas());
    }
}
