use serde::{Deserialize, Serialize};

// Declares the report struct together with its field-wise merge, so a new field can not be
// forgotten in `merge`.
macro_rules! lamp_report {
    ($($(#[$meta:meta])* $field:ident: $ty:ty,)*) => {
        /// Everything the lamp reports about itself. Each field stays `None` until the device
        /// has reported it. The decoder produces values of this type as patches.
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub struct LampReport {
            $(
                $(#[$meta])*
                #[serde(skip_serializing_if = "Option::is_none", default)]
                pub $field: Option<$ty>,
            )*
        }

        impl LampReport {
            /// Copies every field that is present in `patch`, leaves all other fields alone.
            pub fn merge(&mut self, patch: LampReport) {
                $(
                    if patch.$field.is_some() {
                        self.$field = patch.$field;
                    }
                )*
            }

            /// Copies fields of `defaults` only where this report has nothing yet.
            pub fn fill(&mut self, defaults: LampReport) {
                $(
                    if self.$field.is_none() {
                        self.$field = defaults.$field;
                    }
                )*
            }

            pub fn is_empty(&self) -> bool {
                true $(&& self.$field.is_none())*
            }
        }
    };
}

lamp_report! {
    pattern_count: u32,
    current_pattern: u32,
    pattern_name: String,
    pattern_elapsed_ms: u64,
    /// Percent, 0-100
    brightness: f32,
    /// Percent, 0-100
    cap: f32,
    lamp_state: String,
    switch_state: String,
    has_switch: bool,
    touch_state: String,
    has_touch: bool,
    touch_base: i32,
    touch_raw: i32,
    touch_delta: i32,
    touch_thr_on: i32,
    touch_thr_off: i32,
    touch_active: bool,
    last_touch_line: String,
    auto_cycle: bool,
    pattern_speed: f32,
    pattern_fade: f32,
    idle_off_min: u32,
    idle_minutes: u32,
    pwm_curve: f32,
    presence: String,
    has_presence: bool,
    /// Comma separated pattern indices used by quick mode
    quick_csv: String,
    ramp_on_ms: u32,
    ramp_off_ms: u32,
    ramp_on_ease: String,
    ramp_off_ease: String,
    ramp_on_pow: f32,
    ramp_off_pow: f32,
    custom_len: u32,
    custom_step_ms: u32,
    custom_csv: String,
    bri_min: f32,
    bri_max: f32,
    has_light: bool,
    light_enabled: bool,
    light_gain: f32,
    light_alpha: f32,
    light_clamp_min: f32,
    light_clamp_max: f32,
    light_raw: f32,
    light_raw_min: f32,
    light_raw_max: f32,
    has_music: bool,
    music_enabled: bool,
    music_gain: f32,
    music_auto: bool,
    music_auto_thr: f32,
    music_mode: String,
    music_mod: f32,
    clap_enabled: bool,
    clap_threshold: f32,
    clap_cooldown_ms: u32,
    has_poti: bool,
    poti_enabled: bool,
    poti_alpha: f32,
    poti_delta: f32,
    poti_off: f32,
    poti_sample: u32,
    has_push: bool,
    push_enabled: bool,
    push_debounce_ms: u32,
    push_double_ms: u32,
    push_hold_ms: u32,
    push_step_ms: u32,
    push_step: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStatus {
    pub connected: bool,
    pub connecting: bool,
    pub device_name: String,
    /// Unix time in milliseconds of the last recognized status line
    pub last_status_at: Option<u64>,
    #[serde(flatten)]
    pub report: LampReport,
}

impl DeviceStatus {
    pub fn pattern_count(&self) -> u32 {
        self.report.pattern_count.unwrap_or(0)
    }

    /// Merges a decoded patch, then fills still unknown fields from `defaults`, and stamps the
    /// time of the update.
    pub fn apply(&mut self, patch: LampReport, defaults: LampReport, now_ms: u64) {
        self.report.merge(patch);
        self.report.fill(defaults);
        self.last_status_at = Some(now_ms);
    }

    /// Returns to the disconnected shape. Configuration-like fields (ramps, quick mode, ...)
    /// survive; the live lamp state does not.
    pub fn reset_disconnected(&mut self) {
        self.connected = false;
        self.connecting = false;
        self.device_name.clear();
        self.report.current_pattern = None;
        self.report.brightness = None;
        self.report.cap = None;
        self.report.lamp_state = None;
        self.report.switch_state = None;
        self.report.touch_state = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_fields_missing_from_patch() {
        let mut report = LampReport {
            brightness: Some(10.0),
            lamp_state: Some("ON".to_string()),
            ..Default::default()
        };

        report.merge(LampReport { brightness: Some(55.0), ..Default::default() });

        assert_eq!(report.brightness, Some(55.0));
        assert_eq!(report.lamp_state.as_deref(), Some("ON"));
        assert!(!report.is_empty());
        assert!(LampReport::default().is_empty());
    }

    #[test]
    fn apply_stamps_time() {
        let mut status = DeviceStatus::default();
        assert_eq!(status.pattern_count(), 0);

        status.apply(LampReport { pattern_count: Some(12), ..Default::default() }, LampReport::default(), 1234);
        assert_eq!(status.pattern_count(), 12);
        assert_eq!(status.last_status_at, Some(1234));
    }

    #[test]
    fn defaults_only_fill_unknown_fields() {
        let mut status = DeviceStatus::default();
        let defaults = LampReport { has_light: Some(true), light_enabled: Some(true), ..Default::default() };

        status.apply(LampReport::default(), defaults.clone(), 1);
        assert_eq!(status.report.has_light, Some(true));

        status.apply(LampReport { light_enabled: Some(false), ..Default::default() }, LampReport::default(), 2);
        status.apply(LampReport::default(), defaults, 3);
        assert_eq!(status.report.light_enabled, Some(false));
    }

    #[test]
    fn reset_clears_live_state_only() {
        let mut status = DeviceStatus {
            connected: true,
            device_name: "Quarzlampe".to_string(),
            ..Default::default()
        };
        status.report.brightness = Some(40.0);
        status.report.ramp_on_ms = Some(500);

        status.reset_disconnected();

        assert!(!status.connected);
        assert!(status.device_name.is_empty());
        assert_eq!(status.report.brightness, None);
        assert_eq!(status.report.ramp_on_ms, Some(500));
    }

    #[test]
    fn serializes_flat_camel_case() {
        let mut status = DeviceStatus::default();
        status.report.quick_csv = Some("1,4".to_string());
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["quickCsv"], "1,4");
        assert_eq!(json["connected"], false);
        assert!(json.get("brightness").is_none());
    }
}
