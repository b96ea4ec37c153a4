//! Session descriptions as short, URL-safe tokens.
//!
//! A description is first packed: frequent SDP phrases become one byte each,
//! ASCII passes through and anything else is escaped. The packed bytes are
//! then base64 encoded with `/`, `+` and `=` mapped to `_`, `~` and `-` so the
//! token can sit in a query string untouched.
//!
//! Offers carry `a=setup:actpass` and answers `a=setup:active`. Both pack to
//! the same byte, so decoding needs to know which side produced the token.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use url::Url;

use crate::error::SignalingError;

/// First packed byte; bump when the dictionary changes
const FORMAT_VERSION: u8 = 0x01;
const DICT_BASE: u8 = 0x80;
const ROLE_CODE: u8 = 0xFE;
const ESCAPE: u8 = 0xFF;

const OFFER_SETUP: &str = "\r\na=setup:actpass";
const ANSWER_SETUP: &str = "\r\na=setup:active";

/// Query parameter a share link carries the token in
pub const SDP_PARAM: &str = "sdp";

/// Wire format: codes are `DICT_BASE + index`. Append only.
const DICTIONARY: &[&str] = &[
    "v=0\r\no=- ",
    " 2 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0",
    "\r\na=group:BUNDLE ",
    "\r\na=extmap-allow-mixed",
    "\r\na=msid-semantic: WMS",
    "\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel",
    "\r\nm=audio 9 UDP/TLS/RTP/SAVPF ",
    "\r\nm=video 9 UDP/TLS/RTP/SAVPF ",
    "\r\nc=IN IP4 0.0.0.0",
    "\r\na=rtcp:9 IN IP4 0.0.0.0",
    "\r\na=candidate:",
    "\r\na=end-of-candidates",
    "\r\na=ice-ufrag:",
    "\r\na=ice-pwd:",
    "\r\na=ice-options:trickle",
    "\r\na=fingerprint:sha-256 ",
    "\r\na=setup:passive",
    "\r\na=mid:",
    "\r\na=msid:",
    "\r\na=sctp-port:5000",
    "\r\na=sctp-port:",
    "\r\na=max-message-size:262144",
    "\r\na=max-message-size:",
    "\r\na=sendrecv",
    "\r\na=sendonly",
    "\r\na=recvonly",
    "\r\na=inactive",
    "\r\na=rtcp-mux",
    "\r\na=rtcp-rsize",
    "\r\na=rtpmap:",
    "\r\na=rtcp-fb:",
    "\r\na=fmtp:",
    "\r\na=extmap:",
    "\r\na=ssrc-group:FID ",
    "\r\na=ssrc:",
    "\r\na=",
    "\r\n",
    " udp ",
    " tcp ",
    " typ host",
    " typ srflx",
    " typ relay",
    " typ prflx",
    " raddr ",
    " rport ",
    " generation 0",
    " network-id ",
    " network-cost ",
    " tcptype active",
    " tcptype passive",
    " ufrag ",
    ".local",
    "0.0.0.0",
    "127.0.0.1",
    "IN IP4 ",
    "IN IP6 ",
    "webrtc-datachannel",
    "UDP/DTLS/SCTP",
    "UDP/TLS/RTP/SAVPF",
    "opus/48000/2",
    "minptime=10;useinbandfec=1",
    "VP8/90000",
    "VP9/90000",
    "H264/90000",
    "rtx/90000",
    "red/90000",
    "ulpfec/90000",
    "apt=",
    "goog-remb",
    "transport-cc",
    "ccm fir",
    "nack pli",
    "nack",
    "level-asymmetry-allowed=1;packetization-mode=",
    "profile-level-id=",
    "urn:ietf:params:rtp-hdrext:",
    "http://www.webrtc.org/experiments/rtp-hdrext/",
    "sdes:mid",
    "ssrc-audio-level",
    "toffset",
    "abs-send-time",
    "cname:",
    "candidate:",
    "sha-256",
    "trickle",
    "0000",
    "000",
    "00",
];

const _: () = assert!(DICTIONARY.len() <= (ROLE_CODE - DICT_BASE) as usize);

fn role_phrase(is_offer: bool) -> &'static str {
    if is_offer { OFFER_SETUP } else { ANSWER_SETUP }
}

/// The setup line a description carries, if it carries exactly one kind
fn setup_phrase(sdp: &str) -> Option<&'static str> {
    match (sdp.contains(OFFER_SETUP), sdp.contains(ANSWER_SETUP)) {
        (true, false) => Some(OFFER_SETUP),
        (false, true) => Some(ANSWER_SETUP),
        _ => None,
    }
}

fn longest_entry(rest: &[u8]) -> Option<(u8, usize)> {
    DICTIONARY
        .iter()
        .enumerate()
        .filter(|(_, entry)| rest.starts_with(entry.as_bytes()))
        .max_by_key(|(_, entry)| entry.len())
        .map(|(index, entry)| (DICT_BASE + index as u8, entry.len()))
}

fn pack(sdp: &str) -> Vec<u8> {
    let text = sdp.as_bytes();
    let setup = setup_phrase(sdp);
    let mut out = Vec::with_capacity(text.len() / 2 + 1);
    out.push(FORMAT_VERSION);

    let mut pos = 0;
    while pos < text.len() {
        let rest = &text[pos..];
        if let Some(phrase) = setup.filter(|p| rest.starts_with(p.as_bytes())) {
            out.push(ROLE_CODE);
            pos += phrase.len();
        } else if let Some((code, len)) = longest_entry(rest) {
            out.push(code);
            pos += len;
        } else {
            let byte = text[pos];
            if byte >= DICT_BASE {
                out.push(ESCAPE);
            }
            out.push(byte);
            pos += 1;
        }
    }
    out
}

fn unpack(packed: &[u8], is_offer: bool) -> Result<String, SignalingError> {
    let (&version, body) = packed.split_first().ok_or(SignalingError::Empty)?;
    if version != FORMAT_VERSION {
        return Err(SignalingError::UnsupportedVersion(version));
    }

    let mut out = Vec::with_capacity(body.len() * 2);
    let mut bytes = body.iter().copied();
    while let Some(byte) = bytes.next() {
        match byte {
            ESCAPE => out.push(bytes.next().ok_or(SignalingError::DanglingEscape)?),
            ROLE_CODE => out.extend_from_slice(role_phrase(is_offer).as_bytes()),
            b if b >= DICT_BASE => {
                let entry = DICTIONARY
                    .get(usize::from(b - DICT_BASE))
                    .ok_or(SignalingError::UnknownCode(b))?;
                out.extend_from_slice(entry.as_bytes());
            }
            literal => out.push(literal),
        }
    }
    String::from_utf8(out).map_err(|_| SignalingError::InvalidUtf8)
}

/// Compact a session description into a URL-safe token
pub fn encode(sdp: &str) -> String {
    STANDARD
        .encode(pack(sdp))
        .chars()
        .map(|c| match c {
            '/' => '_',
            '+' => '~',
            '=' => '-',
            other => other,
        })
        .collect()
}

/// Inverse of [`encode`]. `is_offer` must name the side that produced the token.
pub fn decode(token: &str, is_offer: bool) -> Result<String, SignalingError> {
    let token = token.trim();
    if token.is_empty() {
        return Err(SignalingError::Empty);
    }
    let base64: String = token
        .chars()
        .map(|c| match c {
            '_' => Ok('/'),
            '~' => Ok('+'),
            '-' => Ok('='),
            c if c.is_ascii_alphanumeric() => Ok(c),
            other => Err(SignalingError::InvalidCharacter(other)),
        })
        .collect::<Result<_, _>>()?;
    let packed = STANDARD
        .decode(base64)
        .map_err(|e| SignalingError::Base64(e.to_string()))?;
    unpack(&packed, is_offer)
}

/// `base` with the token appended as the `sdp` query parameter
pub fn share_url(base: &str, token: &str) -> Result<String, SignalingError> {
    let mut url = Url::parse(base).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;
    let query = match url.query() {
        Some(existing) if !existing.is_empty() => format!("{}&{}={}", existing, SDP_PARAM, token),
        _ => format!("{}={}", SDP_PARAM, token),
    };
    url.set_query(Some(&query));
    Ok(url.into())
}

pub fn token_from_url(url: &str) -> Result<String, SignalingError> {
    let url = Url::parse(url).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;
    url.query_pairs()
        .find(|(key, _)| key == SDP_PARAM)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
        .ok_or(SignalingError::MissingToken)
}
