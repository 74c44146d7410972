//! Maps status lines sent by the lamp firmware to [`LampReport`] patches.
//!
//! The firmware speaks a loose, line based text protocol. Every line shape is handled by one
//! [`Rule`]; rules are pure and independent of each other. All rules that match a line
//! contribute to the patch, later rules overwriting fields set by earlier ones. Exclusive rules
//! (the `|` separated snapshot lines) are checked first and decide a line on their own.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::LazyLock;
use regex::Regex;

use crate::protocol::status::LampReport;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Decoded {
    pub patch: LampReport,
    /// Values that only count for fields the lamp has not reported yet
    pub defaults: LampReport,
    /// true if at least one rule recognized the line
    pub handled: bool,
}

pub struct Rule {
    pub name: &'static str,
    exclusive: bool,
    extract: fn(&str) -> Option<LampReport>,
}

impl Rule {
    pub fn apply(&self, line: &str) -> Option<LampReport> {
        (self.extract)(line)
    }
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("name", &self.name)
            .field("exclusive", &self.exclusive)
            .finish()
    }
}

/// Evaluation order matters: when two rules set the same field, the later one wins.
pub static RULES: &[Rule] = &[
    Rule { name: "status-snapshot", exclusive: true, extract: status_snapshot },
    Rule { name: "sensors", exclusive: true, extract: sensors },
    Rule { name: "clap", exclusive: true, extract: clap },
    Rule { name: "switch-touch", exclusive: false, extract: switch_touch },
    Rule { name: "lamp", exclusive: false, extract: lamp },
    Rule { name: "pattern", exclusive: false, extract: pattern },
    Rule { name: "mode", exclusive: false, extract: mode },
    Rule { name: "quick", exclusive: false, extract: quick },
    Rule { name: "touch", exclusive: false, extract: touch },
    Rule { name: "ramp", exclusive: false, extract: ramp },
    Rule { name: "ramp-on-off", exclusive: false, extract: ramp_on_off },
    Rule { name: "presence", exclusive: false, extract: presence },
    Rule { name: "custom", exclusive: false, extract: custom },
    Rule { name: "custom-export", exclusive: false, extract: custom_export },
    Rule { name: "music", exclusive: false, extract: music },
    Rule { name: "light", exclusive: false, extract: light },
];

pub fn decode(line: &str) -> Decoded {
    let mut decoded = Decoded::default();
    if line.is_empty() {
        return decoded;
    }

    for rule in RULES.iter().filter(|rule| rule.exclusive) {
        if let Some(patch) = rule.apply(line) {
            return Decoded { patch, handled: true, ..Default::default() };
        }
    }

    for rule in RULES.iter().filter(|rule| !rule.exclusive) {
        if let Some(patch) = rule.apply(line) {
            decoded.patch.merge(patch);
            decoded.handled = true;
        }
    }
    decoded.defaults = light_defaults(line);

    decoded
}

macro_rules! pattern {
    ($name:ident, $re:expr) => {
        static $name: LazyLock<Regex> = LazyLock::new(|| Regex::new($re).unwrap());
    };
}

pattern!(SWITCH_ANY, r"(?i)Switch[:=]\s*([A-Za-z0-9]+)");
pattern!(TOUCH_ANY, r"(?i)Touch[:=]\s*([A-Za-z0-9]+)");
pattern!(BRIGHTNESS, r"Brightness=([0-9.]+)");
pattern!(CAP, r"Cap=([0-9.]+)");
pattern!(LAMP, r"Lamp=([A-Z]+)");
pattern!(SWITCH, r"Switch=([A-Z]+)");
pattern!(PATTERN, r"Pattern\s+(\d+)/(\d+).*?'([^']+)'");
pattern!(AUTO_CYCLE, r"AutoCycle=(ON|OFF)");
pattern!(SPEED, r"Speed=([0-9.]+)");
pattern!(MODE_INDEX, r"(?i)Mode\]\s*([0-9]+)");
pattern!(MODE_TOTAL, r"/\s*([0-9]+)");
pattern!(TOUCH_BASE, r"base=([0-9]+)");
pattern!(TOUCH_RAW, r"raw=([0-9]+)");
pattern!(TOUCH_DELTA, r"delta=([-0-9]+)");
pattern!(TOUCH_THR_ON, r"thrOn=([0-9]+)");
pattern!(TOUCH_THR_OFF, r"thrOff=([0-9]+)");
pattern!(RAMP_ON, r"Ramp=([0-9]+)");
pattern!(RAMP_OFF, r"/\s*([0-9]+)ms");
pattern!(IDLE_OFF, r"IdleOff=([0-9]+)m");
pattern!(PAT_FADE, r"PatFade=ON\(([0-9.]+)\)");
pattern!(TOUCH_DIM, r"TouchDim=(ON|OFF)");
pattern!(RAMP_ON_OFF_ANY, r"(?i)RampO(n|ff)");
pattern!(RAMP_ON_VALUE, r"(?i)RampOn[:=]?\s*([0-9]+)");
pattern!(RAMP_OFF_VALUE, r"(?i)RampOff[:=]?\s*([0-9]+)");
pattern!(CUSTOM_LEN, r"len=([0-9]+)");
pattern!(CUSTOM_STEP, r"stepMs=([0-9]+)");
pattern!(LIGHT_RAW, r"(?i)raw=([0-9.]+)");
pattern!(LIGHT_MIN, r"(?i)min=([0-9.]+)");
pattern!(LIGHT_MAX, r"(?i)max=([0-9.]+)");
pattern!(CLAP_STATE, r"(?i)^\[Clap\]\s*(ON|OFF)\b");
pattern!(CLAP_THRESHOLD, r"(?i)thr=([0-9.]+)");
pattern!(CLAP_COOLDOWN, r"(?i)cool=([0-9]+)");

fn capture<'a>(re: &Regex, line: &'a str) -> Option<&'a str> {
    re.captures(line).and_then(|caps| caps.get(1)).map(|m| m.as_str())
}

fn capture_parse<T: FromStr>(re: &Regex, line: &str) -> Option<T> {
    capture(re, line).and_then(|value| value.parse().ok())
}

/// Parses the leading integer of `value`, ignoring anything after it (`"12.5"` is 12).
fn parse_int<T: FromStr>(value: &str) -> Option<T> {
    let value = value.trim();
    let sign = usize::from(value.starts_with('-'));
    let digits = value[sign..].bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    value[..sign + digits].parse().ok()
}

fn switch_touch(line: &str) -> Option<LampReport> {
    let switch = capture(&SWITCH_ANY, line);
    let touch = capture(&TOUCH_ANY, line);
    if switch.is_none() && touch.is_none() {
        return None;
    }

    Some(LampReport {
        switch_state: switch.map(str::to_uppercase),
        touch_state: touch.map(str::to_uppercase),
        ..Default::default()
    })
}

fn lamp(line: &str) -> Option<LampReport> {
    if !line.contains("Lamp=") {
        return None;
    }

    Some(LampReport {
        brightness: capture_parse(&BRIGHTNESS, line),
        cap: capture_parse(&CAP, line),
        lamp_state: capture(&LAMP, line).map(String::from),
        switch_state: capture(&SWITCH, line).map(String::from),
        ..Default::default()
    })
}

fn pattern(line: &str) -> Option<LampReport> {
    if !line.starts_with("Pattern ") {
        return None;
    }
    let caps = PATTERN.captures(line)?;

    Some(LampReport {
        current_pattern: caps[1].parse().ok(),
        pattern_count: caps[2].parse().ok(),
        pattern_name: Some(caps[3].to_string()),
        auto_cycle: capture(&AUTO_CYCLE, line).map(|v| v == "ON"),
        pattern_speed: capture_parse(&SPEED, line),
        ..Default::default()
    })
}

fn mode(line: &str) -> Option<LampReport> {
    if !line.starts_with("[Mode]") {
        return None;
    }

    let name = line.split('-').skip(1).collect::<Vec<_>>().join("-");
    let name = name.trim();

    Some(LampReport {
        current_pattern: capture_parse(&MODE_INDEX, line),
        pattern_count: capture_parse(&MODE_TOTAL, line),
        pattern_name: (!name.is_empty()).then(|| name.to_string()),
        ..Default::default()
    })
}

fn quick(line: &str) -> Option<LampReport> {
    let csv = line.strip_prefix("[Quick]")?;

    Some(LampReport {
        quick_csv: Some(csv.trim().to_string()),
        ..Default::default()
    })
}

fn touch(line: &str) -> Option<LampReport> {
    if !line.starts_with("[Touch]") {
        return None;
    }
    let active = line.contains("active=1");

    Some(LampReport {
        touch_state: Some(if active { "TOUCH" } else { "idle" }.to_string()),
        touch_active: Some(active),
        touch_base: capture_parse(&TOUCH_BASE, line),
        touch_raw: capture_parse(&TOUCH_RAW, line),
        touch_delta: capture_parse(&TOUCH_DELTA, line),
        touch_thr_on: capture_parse(&TOUCH_THR_ON, line),
        touch_thr_off: capture_parse(&TOUCH_THR_OFF, line),
        last_touch_line: Some(line.to_string()),
        ..Default::default()
    })
}

fn ramp(line: &str) -> Option<LampReport> {
    if !line.starts_with("Ramp=") {
        return None;
    }
    let idle: Option<u32> = capture_parse(&IDLE_OFF, line);
    let touch_dim = capture(&TOUCH_DIM, line);

    Some(LampReport {
        ramp_on_ms: capture_parse(&RAMP_ON, line),
        ramp_off_ms: capture_parse(&RAMP_OFF, line),
        idle_off_min: idle,
        idle_minutes: idle,
        pattern_fade: capture_parse(&PAT_FADE, line),
        touch_state: (touch_dim == Some("ON")).then(|| "TOUCHDIM".to_string()),
        ..Default::default()
    })
}

fn ramp_on_off(line: &str) -> Option<LampReport> {
    if !RAMP_ON_OFF_ANY.is_match(line) {
        return None;
    }

    Some(LampReport {
        ramp_on_ms: capture_parse(&RAMP_ON_VALUE, line),
        ramp_off_ms: capture_parse(&RAMP_OFF_VALUE, line),
        ..Default::default()
    })
}

fn presence(line: &str) -> Option<LampReport> {
    let value = line.strip_prefix("Presence=")?;

    Some(LampReport {
        presence: Some(value.trim().to_string()),
        ..Default::default()
    })
}

fn custom(line: &str) -> Option<LampReport> {
    if !line.starts_with("[Custom]") {
        return None;
    }

    Some(LampReport {
        custom_len: capture_parse(&CUSTOM_LEN, line),
        custom_step_ms: capture_parse(&CUSTOM_STEP, line),
        ..Default::default()
    })
}

fn custom_export(line: &str) -> Option<LampReport> {
    let kv = KeyValues::parse(line, "CUSTOM|")?;

    Some(LampReport {
        custom_len: kv.int("len"),
        custom_step_ms: kv.int("step"),
        custom_csv: kv.string("vals"),
        ..Default::default()
    })
}

fn music(line: &str) -> Option<LampReport> {
    line.starts_with("[Music]").then(LampReport::default)
}

fn light(line: &str) -> Option<LampReport> {
    if !line.starts_with("[Light]") {
        return None;
    }

    let mut patch = LampReport {
        light_raw: capture_parse(&LIGHT_RAW, line),
        light_raw_min: capture_parse(&LIGHT_MIN, line),
        light_raw_max: capture_parse(&LIGHT_MAX, line),
        ..Default::default()
    };

    if line.to_uppercase().contains("N/A") {
        patch.has_light = Some(false);
        patch.light_enabled = Some(false);
    }

    Some(patch)
}

/// A light line that is not `N/A` means the sensor is there. Whatever the lamp said about it
/// before still wins.
fn light_defaults(line: &str) -> LampReport {
    if !line.starts_with("[Light]") || line.to_uppercase().contains("N/A") {
        return LampReport::default();
    }

    LampReport { has_light: Some(true), light_enabled: Some(true), ..Default::default() }
}

fn clap(line: &str) -> Option<LampReport> {
    if !line.starts_with("[Clap]") {
        return None;
    }

    Some(LampReport {
        clap_enabled: capture(&CLAP_STATE, line).map(|v| v.eq_ignore_ascii_case("ON")),
        clap_threshold: capture_parse(&CLAP_THRESHOLD, line),
        clap_cooldown_ms: capture_parse(&CLAP_COOLDOWN, line),
        ..Default::default()
    })
}

/// The `PREFIX|key=value|key=value` lines.
struct KeyValues<'a> {
    values: HashMap<&'a str, &'a str>,
}

impl<'a> KeyValues<'a> {
    fn parse(line: &'a str, prefix: &str) -> Option<Self> {
        let rest = line.strip_prefix(prefix)?;
        let values = rest
            .split('|')
            .filter_map(|part| part.split_once('='))
            .filter(|(key, _)| !key.is_empty())
            .collect();
        Some(KeyValues { values })
    }

    fn string(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.to_string())
    }

    fn num<T: FromStr>(&self, key: &str) -> Option<T> {
        self.values.get(key).and_then(|v| v.trim().parse().ok())
    }

    fn int<T: FromStr>(&self, key: &str) -> Option<T> {
        self.values.get(key).and_then(|v| parse_int(v))
    }

    fn is_on(&self, key: &str) -> Option<bool> {
        self.values.get(key).map(|v| v.eq_ignore_ascii_case("ON"))
    }

    /// `Some(false)` if the firmware reports the subsystem as `N/A`.
    fn available(&self, key: &str) -> Option<bool> {
        self.values.get(key).map(|v| !v.eq_ignore_ascii_case("N/A"))
    }

    /// Availability and enabled flag of an optional subsystem; an absent subsystem is never
    /// enabled.
    fn subsystem(&self, key: &str) -> (Option<bool>, Option<bool>) {
        match self.available(key) {
            Some(false) => (Some(false), Some(false)),
            available => (available, self.is_on(key)),
        }
    }
}

fn status_snapshot(line: &str) -> Option<LampReport> {
    let kv = KeyValues::parse(line, "STATUS|")?;

    let (has_light, light_enabled) = kv.subsystem("light");
    let (has_music, music_enabled) = kv.subsystem("music");
    let (has_poti, poti_enabled) = kv.subsystem("poti");
    let (has_push, push_enabled) = kv.subsystem("push");
    let idle: Option<u32> = kv.int("idle_min");
    let has_switch = kv.available("switch");

    Some(LampReport {
        pattern_count: kv.int("pattern_total"),
        current_pattern: kv.int("pattern"),
        pattern_name: kv.string("pattern_name"),
        pattern_elapsed_ms: kv.int("pat_ms"),
        auto_cycle: kv.values.get("auto").map(|v| *v == "1"),
        brightness: kv.num("bri"),
        cap: kv.num("cap"),
        lamp_state: kv.string("lamp"),
        switch_state: if has_switch == Some(true) { kv.string("switch") } else { None },
        has_switch,
        has_touch: Some(true),
        touch_state: (kv.values.get("touch_dim") == Some(&"1")).then(|| "TOUCHDIM".to_string()),
        ramp_on_ms: kv.int("ramp_on_ms"),
        ramp_off_ms: kv.int("ramp_off_ms"),
        ramp_on_ease: kv.string("ramp_on_ease"),
        ramp_off_ease: kv.string("ramp_off_ease"),
        ramp_on_pow: kv.num("ramp_on_pow"),
        ramp_off_pow: kv.num("ramp_off_pow"),
        idle_off_min: idle,
        idle_minutes: idle,
        pattern_speed: kv.num("pat_speed"),
        pattern_fade: match kv.values.get("pat_fade") {
            Some(&"off") => Some(0.0),
            _ => kv.num("pat_fade"),
        },
        quick_csv: kv.string("quick"),
        presence: kv.string("presence"),
        has_presence: kv.available("presence"),
        custom_len: kv.int("custom_len"),
        custom_step_ms: kv.int("custom_step_ms"),
        pwm_curve: kv.num("gamma"),
        bri_min: kv.num("bri_min"),
        bri_max: kv.num("bri_max"),
        has_light,
        light_enabled,
        light_gain: kv.num("light_gain"),
        light_alpha: kv.num("light_alpha"),
        light_clamp_min: kv.num("light_min"),
        light_clamp_max: kv.num("light_max"),
        light_raw: kv.num("light_raw"),
        light_raw_min: kv.num("light_min"),
        light_raw_max: kv.num("light_max"),
        has_music,
        music_enabled,
        music_gain: kv.num("music_gain"),
        music_auto: kv.is_on("music_auto"),
        music_auto_thr: kv.num("music_thr"),
        music_mode: kv.string("music_mode"),
        music_mod: kv.num("music_mod"),
        clap_enabled: if has_music == Some(false) { Some(false) } else { kv.is_on("clap") },
        clap_threshold: kv.num("clap_thr"),
        clap_cooldown_ms: kv.int("clap_cool"),
        has_poti,
        poti_enabled,
        poti_alpha: kv.num("poti_alpha"),
        poti_delta: kv.num("poti_delta"),
        poti_off: kv.num("poti_off"),
        poti_sample: kv.int("poti_sample"),
        has_push,
        push_enabled,
        push_debounce_ms: kv.int("push_db"),
        push_double_ms: kv.int("push_dbl"),
        push_hold_ms: kv.int("push_hold"),
        push_step_ms: kv.int("push_step_ms"),
        push_step: kv.num("push_step"),
        ..Default::default()
    })
}

fn sensors(line: &str) -> Option<LampReport> {
    let kv = KeyValues::parse(line, "SENSORS|")?;

    Some(LampReport {
        touch_base: kv.int("touch_base"),
        touch_raw: kv.int("touch_raw"),
        touch_delta: kv.int("touch_delta"),
        touch_active: kv.values.get("touch_active").map(|v| *v == "1"),
        has_light: kv.available("light_raw"),
        light_raw: kv.num("light_raw"),
        light_raw_min: kv.num("light_min"),
        light_raw_max: kv.num("light_max"),
        has_poti: kv.available("poti"),
        has_push: kv.available("push"),
        has_music: kv.available("music"),
        has_presence: kv.available("presence"),
        ..Default::default()
    })
}
