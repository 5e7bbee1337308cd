/// Sensor input parsing: serial access-point lines and BLE advertisements.
///
/// Serial: the Wi-Fi scanner prints one `SSID: <s>, BSSID: <b>, RSSI: <r>`
/// line per access point. UART noise regularly eats the first one or two
/// characters, so the prefix is repaired before the fields are split.
///
/// BLE: deauth sensors broadcast a JSON claim inside manufacturer-specific
/// data. The AD structures are walked the same way the firmware does it.
///
/// Nothing here panics or propagates: every entry point returns
/// `Result<_, MalformedInput>` and the caller logs and drops the record.
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::MalformedInput;
use crate::protocol::{DeauthClaim, MacAddr, NameString, ObservedAccessPoint, MAX_SSID_LEN};

/// Canonical start of a scanner line.
pub const SSID_PREFIX: &str = "SSID: ";
const BSSID_SEP: &str = ", BSSID: ";
const RSSI_SEP: &str = ", RSSI: ";

/// AD type for manufacturer specific data
pub const AD_TYPE_MANUFACTURER_DATA: u8 = 0xFF;

/// Manufacturer payloads of this length or shorter are noise.
pub const MIN_CLAIM_PAYLOAD: usize = 5;

/// How much of the `SSID:` prefix survived the serial link.
///
/// Only these three cases are repaired; anything else is not a scanner line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinePrefix {
    /// `SSID:`
    Intact,
    /// `SID:`, leading `S` lost
    DroppedOne,
    /// `ID:`, leading `SS` lost
    DroppedTwo,
}

impl LinePrefix {
    pub fn classify(line: &str) -> Option<Self> {
        if line.starts_with("SSID:") {
            Some(LinePrefix::Intact)
        } else if line.starts_with("SID:") {
            Some(LinePrefix::DroppedOne)
        } else if line.starts_with("ID:") {
            Some(LinePrefix::DroppedTwo)
        } else {
            None
        }
    }

    /// Characters to put back in front of the line.
    pub fn missing(&self) -> &'static str {
        match self {
            LinePrefix::Intact => "",
            LinePrefix::DroppedOne => "S",
            LinePrefix::DroppedTwo => "SS",
        }
    }
}

/// Restore the `SSID:` prefix of a trimmed scanner line.
pub fn repair_prefix(line: &str) -> Result<String, MalformedInput> {
    let prefix = LinePrefix::classify(line).ok_or(MalformedInput::UnknownPrefix)?;
    let mut repaired = String::with_capacity(line.len() + 2);
    repaired.push_str(prefix.missing());
    repaired.push_str(line);
    Ok(repaired)
}

/// The three raw fields of a canonical scanner line.
#[derive(Debug, PartialEq, Eq)]
pub struct ApFields<'a> {
    pub ssid: &'a str,
    pub bssid: &'a str,
    pub rssi: &'a str,
}

/// Split `SSID: <s>, BSSID: <b>, RSSI: <r>`.
///
/// `<s>` ends at the first `, BSSID: ` and `<b>` at the next `, RSSI: `.
pub fn split_ap_fields(line: &str) -> Result<ApFields<'_>, MalformedInput> {
    let rest = line
        .strip_prefix(SSID_PREFIX)
        .ok_or(MalformedInput::MissingField("SSID"))?;
    let (ssid, rest) = rest
        .split_once(BSSID_SEP)
        .ok_or(MalformedInput::MissingField("BSSID"))?;
    let (bssid, rssi) = rest
        .split_once(RSSI_SEP)
        .ok_or(MalformedInput::MissingField("RSSI"))?;
    Ok(ApFields { ssid, bssid, rssi })
}

/// Turn one raw serial line into an observation stamped with `observed_at`.
pub fn normalize_line(raw: &[u8], observed_at: DateTime<Utc>) -> Result<ObservedAccessPoint, MalformedInput> {
    let text = core::str::from_utf8(raw).map_err(|_| MalformedInput::NotUtf8)?;
    let repaired = repair_prefix(text.trim())?;
    let fields = split_ap_fields(&repaired)?;

    Ok(ObservedAccessPoint {
        ssid: bounded_ssid(fields.ssid)?,
        bssid: fields
            .bssid
            .trim()
            .parse()
            .map_err(|_| MalformedInput::BadMac(fields.bssid.to_string()))?,
        rssi: fields.rssi.trim().parse::<i8>().ok(),
        observed_at,
    })
}

fn bounded_ssid(ssid: &str) -> Result<NameString, MalformedInput> {
    if ssid.len() > MAX_SSID_LEN {
        return Err(MalformedInput::SsidTooLong);
    }
    NameString::try_from(ssid).map_err(|_| MalformedInput::SsidTooLong)
}

// ── BLE advertisements ─────────────────────────────────────────────────

/// One AD structure: `[length] [type] [data...]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdRecord<'a> {
    pub ad_type: u8,
    pub data: &'a [u8],
}

/// Walks raw advertisement data (AD structures).
///
/// Stops at a zero length byte or a structure that runs past the buffer,
/// matching how the firmware treats truncated reports.
pub struct AdvParser<'a> {
    ad_data: &'a [u8],
    pos: usize,
}

impl<'a> AdvParser<'a> {
    pub fn new(ad_data: &'a [u8]) -> Self {
        Self { ad_data, pos: 0 }
    }
}

impl<'a> Iterator for AdvParser<'a> {
    type Item = AdRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let pos = self.pos;
        let len = *self.ad_data.get(pos)? as usize;
        if len == 0 || pos + 1 + len > self.ad_data.len() {
            self.pos = self.ad_data.len();
            return None;
        }
        let record = AdRecord {
            ad_type: self.ad_data[pos + 1],
            data: &self.ad_data[pos + 2..pos + 1 + len],
        };
        self.pos = pos + 1 + len;
        Some(record)
    }
}

/// Decode a deauth claim from one advertisement record.
///
/// Only manufacturer data longer than [`MIN_CLAIM_PAYLOAD`] is considered.
/// The text is decoded lossily and anything before the first `{` (the
/// company identifier) is skipped. All three keys must be present.
pub fn decode_claim(ad_type: u8, payload: &[u8]) -> Result<DeauthClaim, MalformedInput> {
    if ad_type != AD_TYPE_MANUFACTURER_DATA {
        return Err(MalformedInput::NotManufacturerData(ad_type));
    }
    if payload.len() <= MIN_CLAIM_PAYLOAD {
        return Err(MalformedInput::PayloadTooShort(payload.len()));
    }

    let text = String::from_utf8_lossy(payload);
    let start = text.find('{').ok_or(MalformedInput::NotJson)?;
    let body = text[start..].trim_end_matches(|c: char| c == '\0' || c.is_whitespace());

    let record: Value = serde_json::from_str(body).map_err(|_| MalformedInput::NotJson)?;
    let record = record.as_object().ok_or(MalformedInput::NotJson)?;

    let detected_at = record
        .get("detectedAt")
        .ok_or(MalformedInput::MissingField("detectedAt"))?;
    let malicious_mac = record
        .get("maliciousMACAddress")
        .ok_or(MalformedInput::MissingField("maliciousMACAddress"))?;
    let attacked_ssid = record
        .get("attackedSSID")
        .ok_or(MalformedInput::MissingField("attackedSSID"))?;

    let detected_at = detected_at
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s.trim()).ok())
        .map(|t| t.with_timezone(&Utc))
        .ok_or_else(|| MalformedInput::BadTimestamp(detected_at.to_string()))?;
    let malicious_mac: MacAddr = malicious_mac
        .as_str()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| MalformedInput::BadMac(malicious_mac.to_string()))?;
    let attacked_ssid = attacked_ssid
        .as_str()
        .ok_or(MalformedInput::MissingField("attackedSSID"))?;

    Ok(DeauthClaim {
        detected_at,
        malicious_mac,
        attacked_ssid: bounded_ssid(attacked_ssid)?,
    })
}

/// Every deauth claim carried by one advertisement.
///
/// Records other than manufacturer data are skipped silently.
pub fn claims_in(ad_data: &[u8]) -> impl Iterator<Item = Result<DeauthClaim, MalformedInput>> + '_ {
    AdvParser::new(ad_data)
        .filter(|record| record.ad_type == AD_TYPE_MANUFACTURER_DATA)
        .map(|record| decode_claim(record.ad_type, record.data))
}

/// Parse one line of the advertisement feed: the hex dump of an
/// advertisement's AD bytes, optionally preceded by the advertiser address.
pub fn parse_adv_line(raw: &[u8]) -> Result<Vec<u8>, MalformedInput> {
    let text = core::str::from_utf8(raw).map_err(|_| MalformedInput::NotUtf8)?;
    let hex_part = text.split_whitespace().last().ok_or(MalformedInput::BadHex)?;
    hex::decode(hex_part).map_err(|_| MalformedInput::BadHex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    /// Wrap a payload in a single manufacturer-data AD structure.
    fn mfr_record(payload: &[u8]) -> Vec<u8> {
        let mut ad = vec![(payload.len() + 1) as u8, AD_TYPE_MANUFACTURER_DATA];
        ad.extend_from_slice(payload);
        ad
    }

    const CLAIM: &str =
        r#"{"detectedAt":"2024-01-01T00:00:00Z","maliciousMACAddress":"DE:AD:BE:EF:00:01","attackedSSID":"Cafe-WiFi"}"#;

    // ── Prefix repair ───────────────────────────────────────────────

    #[test]
    fn classify_known_prefixes() {
        assert_eq!(LinePrefix::classify("SSID: a"), Some(LinePrefix::Intact));
        assert_eq!(LinePrefix::classify("SID: a"), Some(LinePrefix::DroppedOne));
        assert_eq!(LinePrefix::classify("ID: a"), Some(LinePrefix::DroppedTwo));
        assert_eq!(LinePrefix::classify("D: a"), None);
        assert_eq!(LinePrefix::classify("BSSID: a"), None);
        assert_eq!(LinePrefix::classify(""), None);
    }

    #[test]
    fn repair_restores_dropped_characters() {
        assert_eq!(repair_prefix("SID: x").unwrap(), "SSID: x");
        assert_eq!(repair_prefix("ID: x").unwrap(), "SSID: x");
        assert_eq!(repair_prefix("SSID: x").unwrap(), "SSID: x");
        assert_eq!(repair_prefix("garbage"), Err(MalformedInput::UnknownPrefix));
    }

    // ── normalize_line ──────────────────────────────────────────────

    #[test]
    fn normalize_canonical_line() {
        let ap = normalize_line(b"SSID: Cafe-WiFi, BSSID: aa:bb:cc:11:22:33, RSSI: -40\r", t0()).unwrap();
        assert_eq!(ap.ssid.as_str(), "Cafe-WiFi");
        assert_eq!(ap.bssid.to_string(), "AA:BB:CC:11:22:33");
        assert_eq!(ap.rssi, Some(-40));
        assert_eq!(ap.observed_at, t0());
    }

    #[test]
    fn normalize_non_numeric_rssi_is_unknown() {
        let ap = normalize_line(b"SSID: Lab, BSSID: 00:11:22:33:44:55, RSSI: n/a", t0()).unwrap();
        assert_eq!(ap.rssi, None);
        let ap = normalize_line(b"SSID: Lab, BSSID: 00:11:22:33:44:55, RSSI: -300", t0()).unwrap();
        assert_eq!(ap.rssi, None);
    }

    #[test]
    fn normalize_ssid_ends_at_first_bssid_separator() {
        let ap = normalize_line(b"SSID: a, b, BSSID: 00:11:22:33:44:55, RSSI: -1", t0()).unwrap();
        assert_eq!(ap.ssid.as_str(), "a, b");
    }

    #[test]
    fn normalize_empty_ssid_is_kept() {
        let ap = normalize_line(b"SSID: , BSSID: 00:11:22:33:44:55, RSSI: -70", t0()).unwrap();
        assert_eq!(ap.ssid.as_str(), "");
    }

    #[test]
    fn normalize_rejects_malformed_lines() {
        assert_eq!(normalize_line(&[0xFF, 0xFE, 0x00], t0()), Err(MalformedInput::NotUtf8));
        assert_eq!(normalize_line(b"", t0()), Err(MalformedInput::UnknownPrefix));
        assert_eq!(normalize_line(b"I (123) scan_uart: Wrote 52 bytes", t0()), Err(MalformedInput::UnknownPrefix));
        assert_eq!(normalize_line(b"SSID: x, RSSI: -40", t0()), Err(MalformedInput::MissingField("BSSID")));
        assert_eq!(normalize_line(b"SSID: x, BSSID: 00:11:22:33:44:55", t0()), Err(MalformedInput::MissingField("RSSI")));
        assert_eq!(
            normalize_line(b"SSID: x, BSSID: nope, RSSI: -1", t0()),
            Err(MalformedInput::BadMac("nope".into()))
        );
        let long = format!("SSID: {}, BSSID: 00:11:22:33:44:55, RSSI: -1", "x".repeat(33));
        assert_eq!(normalize_line(long.as_bytes(), t0()), Err(MalformedInput::SsidTooLong));
    }

    proptest! {
        #[test]
        fn truncation_repair_recovers_same_fields(
            ssid in "[A-Za-z0-9_ .-]{0,32}",
            mac in proptest::array::uniform6(any::<u8>()),
            rssi in -100i8..=0,
            dropped in 0usize..=2,
        ) {
            let bssid = MacAddr::new(mac);
            let line = format!("SSID: {ssid}, BSSID: {bssid}, RSSI: {rssi}");
            let intact = normalize_line(line.as_bytes(), t0()).unwrap();
            let truncated = normalize_line(&line.as_bytes()[dropped..], t0()).unwrap();
            prop_assert_eq!(&truncated, &intact);
            prop_assert_eq!(intact.ssid.as_str(), ssid.as_str());
            prop_assert_eq!(intact.bssid, bssid);
            prop_assert_eq!(intact.rssi, Some(rssi));
        }
    }

    // ── AdvParser ───────────────────────────────────────────────────

    #[test]
    fn adv_parser_walks_structures() {
        // flags, complete name "AB", manufacturer data 0xFFFF + 0x01
        let ad = [0x02, 0x01, 0x06, 0x03, 0x09, b'A', b'B', 0x04, 0xFF, 0xFF, 0xFF, 0x01];
        let records: Vec<_> = AdvParser::new(&ad).collect();
        assert_eq!(records.len(), 3);
        assert_eq!(records[1], AdRecord { ad_type: 0x09, data: b"AB" });
        assert_eq!(records[2].data, &[0xFF, 0xFF, 0x01]);
    }

    #[test]
    fn adv_parser_stops_on_overrun_and_zero_length() {
        let overrun = [0x02, 0x01, 0x06, 0x10, 0xFF, 0x00];
        assert_eq!(AdvParser::new(&overrun).count(), 1);
        let zero = [0x00, 0x02, 0x01, 0x06];
        assert_eq!(AdvParser::new(&zero).count(), 0);
        assert_eq!(AdvParser::new(&[]).count(), 0);
    }

    // ── decode_claim ────────────────────────────────────────────────

    #[test]
    fn decode_claim_with_company_id_prefix() {
        let mut payload = vec![0xFF, 0xFF];
        payload.extend_from_slice(CLAIM.as_bytes());
        payload.extend_from_slice(&[0, 0]);
        let claim = decode_claim(AD_TYPE_MANUFACTURER_DATA, &payload).unwrap();
        assert_eq!(claim.detected_at, t0());
        assert_eq!(claim.malicious_mac.to_string(), "DE:AD:BE:EF:00:01");
        assert_eq!(claim.attacked_ssid.as_str(), "Cafe-WiFi");
    }

    #[test]
    fn decode_claim_ignores_wrong_type_and_short_payloads() {
        assert_eq!(
            decode_claim(0x09, CLAIM.as_bytes()),
            Err(MalformedInput::NotManufacturerData(0x09))
        );
        assert_eq!(
            decode_claim(AD_TYPE_MANUFACTURER_DATA, b"{}   "),
            Err(MalformedInput::PayloadTooShort(5))
        );
        assert_eq!(decode_claim(AD_TYPE_MANUFACTURER_DATA, &[]), Err(MalformedInput::PayloadTooShort(0)));
    }

    #[test]
    fn decode_claim_rejects_garbage() {
        assert_eq!(
            decode_claim(AD_TYPE_MANUFACTURER_DATA, b"\xff\xffhello world"),
            Err(MalformedInput::NotJson)
        );
        assert_eq!(
            decode_claim(AD_TYPE_MANUFACTURER_DATA, b"{\"detectedAt\": 1"),
            Err(MalformedInput::NotJson)
        );
        assert_eq!(
            decode_claim(AD_TYPE_MANUFACTURER_DATA, b"[1, 2, 3, 4]"),
            Err(MalformedInput::NotJson)
        );
    }

    #[test]
    fn decode_claim_validates_field_values() {
        let bad_mac = r#"{"detectedAt":"2024-01-01T00:00:00Z","maliciousMACAddress":"zz","attackedSSID":"x"}"#;
        assert!(matches!(
            decode_claim(AD_TYPE_MANUFACTURER_DATA, bad_mac.as_bytes()),
            Err(MalformedInput::BadMac(_))
        ));
        let bad_time = r#"{"detectedAt":"yesterday","maliciousMACAddress":"DE:AD:BE:EF:00:01","attackedSSID":"x"}"#;
        assert!(matches!(
            decode_claim(AD_TYPE_MANUFACTURER_DATA, bad_time.as_bytes()),
            Err(MalformedInput::BadTimestamp(_))
        ));
    }

    proptest! {
        #[test]
        fn decode_claim_missing_any_key_is_rejected(skip in 0usize..3, junk in proptest::collection::vec(0x80u8..=0xFF, 0..3)) {
            let fields = [
                ("detectedAt", "2024-01-01T00:00:00Z"),
                ("maliciousMACAddress", "DE:AD:BE:EF:00:01"),
                ("attackedSSID", "Cafe-WiFi"),
            ];
            let body: Vec<String> = fields
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != skip)
                .map(|(_, (k, v))| format!("\"{k}\":\"{v}\""))
                .collect();
            let mut payload = junk.clone();
            payload.extend_from_slice(format!("{{{}}}", body.join(",")).as_bytes());
            let result = decode_claim(AD_TYPE_MANUFACTURER_DATA, &payload);
            prop_assert_eq!(result, Err(MalformedInput::MissingField(fields[skip].0)));
        }
    }

    // ── Feed lines ──────────────────────────────────────────────────

    #[test]
    fn claims_in_advertisement_skips_other_records() {
        let mut ad = vec![0x02, 0x01, 0x06];
        ad.extend(mfr_record(CLAIM.as_bytes()));
        let claims: Vec<_> = claims_in(&ad).collect();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].as_ref().unwrap().attacked_ssid.as_str(), "Cafe-WiFi");
    }

    #[test]
    fn parse_adv_line_with_and_without_address() {
        assert_eq!(parse_adv_line(b"020106").unwrap(), vec![0x02, 0x01, 0x06]);
        assert_eq!(parse_adv_line(b"AA:BB:CC:DD:EE:FF 020106\r").unwrap(), vec![0x02, 0x01, 0x06]);
        assert_eq!(parse_adv_line(b"zz"), Err(MalformedInput::BadHex));
        assert_eq!(parse_adv_line(b"   "), Err(MalformedInput::BadHex));
    }
}
