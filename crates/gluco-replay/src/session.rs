//! Replay state owned by the single processing task.

use std::collections::VecDeque;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use gluco_core::wire::dexcom::{RxMessage, SensorDataRx};
use gluco_core::{
    CalculatedReading, CalibrationInput, CalibrationPoint, Calibrator, CalibratorKind,
    CoreConfig, FragmentReassembler, InitialCalibrationInput, MiaoMiaoResponse, RawSample,
    ReadingInput, SensorSession, TransmitterClock,
};
use tracing::{debug, info, warn};

use crate::event::{decode_hex, ReplayEvent, ReplayRecord};

/// Readings kept for curve fitting and re-calibration, one day at five
/// minute intervals.
const MAX_READINGS: usize = 288;

/// Calibrations kept for fitting.
const MAX_CALIBRATIONS: usize = 50;

/// Counters reported when the replay ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    /// Events handled.
    pub events: usize,
    /// Packets that did not decode.
    pub rejected_packets: usize,
    /// Readings produced.
    pub readings: usize,
    /// Calibrations produced.
    pub calibrations: usize,
}

/// History and per-connection state of one replayed transmitter.
pub struct Session {
    calibrator: CalibratorKind,
    reassembler: FragmentReassembler,
    clock: Option<TransmitterClock>,
    sensor: Option<SensorSession>,
    // Newest first.
    readings: VecDeque<CalculatedReading>,
    calibrations: VecDeque<CalibrationPoint>,
    first_calibration: Option<CalibrationPoint>,
    // Maps capture timestamps onto the monotonic clock the reassembler uses.
    origin: Option<(DateTime<Utc>, Instant)>,
    stats: ReplayStats,
}

impl Session {
    /// Creates an empty session using the configured calibrator.
    pub fn new(config: &CoreConfig) -> Self {
        Self {
            calibrator: config.calibrator(),
            reassembler: FragmentReassembler::new(&config.reassembly),
            clock: None,
            sensor: None,
            readings: VecDeque::new(),
            calibrations: VecDeque::new(),
            first_calibration: None,
            origin: None,
            stats: ReplayStats::default(),
        }
    }

    /// Counters so far.
    pub const fn stats(&self) -> ReplayStats {
        self.stats
    }

    /// Applies one event and returns the records it produced.
    ///
    /// # Errors
    ///
    /// Returns an error if a payload is not valid hex.
    pub fn handle(&mut self, event: ReplayEvent) -> anyhow::Result<Vec<ReplayRecord>> {
        self.stats.events += 1;
        let records = match event {
            ReplayEvent::SensorStart { at } => {
                self.start_sensor(at);
                Vec::new()
            }
            ReplayEvent::Packet { at, hex } => self.handle_packet(at, &decode_hex(&hex)?),
            ReplayEvent::Fragment { at, hex } => self.handle_fragment(at, &decode_hex(&hex)?),
            ReplayEvent::Calibration { at, bg, second_bg } => match second_bg {
                Some(second) if self.calibrations.is_empty() => {
                    self.initial_calibration(at, bg, second)
                }
                _ => self.calibrate(at, bg),
            },
        };
        Ok(records)
    }

    fn start_sensor(&mut self, at: DateTime<Utc>) {
        if let Some(previous) = self.sensor.as_mut().filter(|s| s.is_active()) {
            previous.stop(at);
            info!(sensor = %previous.id, "Stopped previous sensor");
        }
        let sensor = SensorSession::start(at);
        info!(sensor = %sensor.id, start = %at, "Sensor started");
        self.sensor = Some(sensor);
        self.readings.clear();
        self.calibrations.clear();
        self.first_calibration = None;
    }

    fn handle_packet(&mut self, at: DateTime<Utc>, bytes: &[u8]) -> Vec<ReplayRecord> {
        if let Some(message) = RxMessage::decode(bytes) {
            return self.handle_dexcom(at, message);
        }
        if let Some(response) = MiaoMiaoResponse::decode(bytes) {
            match response {
                MiaoMiaoResponse::Data(packet) => info!(
                    sensor_uid = %hex::encode(packet.sensor_uid),
                    battery = packet.battery_percent,
                    firmware = packet.firmware,
                    "Bridge sensor read"
                ),
                other => info!(?other, "Bridge status"),
            }
            return Vec::new();
        }
        self.stats.rejected_packets += 1;
        debug!(len = bytes.len(), "Discarding undecodable packet");
        Vec::new()
    }

    fn handle_dexcom(&mut self, at: DateTime<Utc>, message: RxMessage) -> Vec<ReplayRecord> {
        match message {
            RxMessage::TransmitterTime(time) => {
                let clock = TransmitterClock::from_time_response(&time, at);
                if let Some(start) = clock.session_start() {
                    if self.sensor.is_none() {
                        self.start_sensor(start);
                    }
                }
                debug!(activation = %clock.activation(), "Transmitter clock synchronized");
                self.clock = Some(clock);
            }
            RxMessage::SensorData(data) => return self.record_reading(at, &data),
            RxMessage::Glucose(glucose) => info!(
                glucose = glucose.glucose,
                trend = glucose.trend,
                display_only = glucose.display_only,
                "Transmitter glucose"
            ),
            RxMessage::BatteryStatus(battery) => info!(
                voltage_a = battery.voltage_a,
                voltage_b = battery.voltage_b,
                resistance = battery.resistance,
                "Battery status"
            ),
            RxMessage::SessionStart(start) => {
                let started = self.clock_at(at, start.transmitter_time);
                self.start_sensor(started.to_wall_clock(start.session_start_time));
            }
            RxMessage::SessionStop(stop) => {
                let stopped = self.clock_at(at, stop.transmitter_time);
                if let Some(sensor) = self.sensor.as_mut() {
                    sensor.stop(stopped.to_wall_clock(stop.session_stop_time));
                    info!(sensor = %sensor.id, "Sensor stopped");
                }
            }
            RxMessage::TransmitterVersion(version) => info!(
                firmware = %version.firmware_version(),
                "Transmitter version"
            ),
            other => debug!(opcode = ?other.opcode(), "Ignoring message"),
        }
        Vec::new()
    }

    /// The synchronized clock, or one pinned by a transmitter timestamp
    /// received at `at`.
    fn clock_at(&self, at: DateTime<Utc>, transmitter_seconds: u32) -> TransmitterClock {
        self.clock.unwrap_or_else(|| {
            TransmitterClock::new(at - Duration::seconds(i64::from(transmitter_seconds)), None)
        })
    }

    fn record_reading(&mut self, at: DateTime<Utc>, data: &SensorDataRx) -> Vec<ReplayRecord> {
        let clock = self.clock_at(at, data.timestamp);
        let sample = RawSample::from_sensor_data(data, &clock);
        let recent_readings: &[CalculatedReading] = self.readings.make_contiguous();
        let recent_calibrations: &[CalibrationPoint] = self.calibrations.make_contiguous();

        let reading = self.calibrator.create_new_bg_reading(ReadingInput {
            raw_data: sample.raw_value,
            timestamp: Some(sample.timestamp),
            sensor: self.sensor.as_ref(),
            recent_readings,
            recent_calibrations,
            first_calibration: self.first_calibration.as_ref(),
            last_calibration: recent_calibrations.first(),
            device_name: None,
        });
        debug!(
            raw = sample.raw_value,
            value = reading.calculated_value,
            slope = reading.calculated_value_slope,
            "Reading"
        );

        self.readings.push_front(reading.clone());
        self.readings.truncate(MAX_READINGS);
        self.stats.readings += 1;
        vec![ReplayRecord::Reading(reading)]
    }

    fn calibrate(&mut self, at: DateTime<Utc>, bg: f64) -> Vec<ReplayRecord> {
        let (last_reading, older) = match self.readings.make_contiguous().split_first_mut() {
            Some((last, older)) => (Some(last), older),
            None => (None, Default::default()),
        };
        let point = self.calibrator.create_new_calibration(CalibrationInput {
            bg_value: bg,
            timestamp: Some(at),
            last_reading,
            sensor: self.sensor.as_ref(),
            recent_calibrations: self.calibrations.make_contiguous(),
            first_calibration: self.first_calibration.as_ref(),
            recent_readings: older,
            device_name: None,
        });
        let Some(point) = point else {
            warn!(bg, "Calibration not possible yet");
            return Vec::new();
        };
        self.push_calibration(point.clone());
        vec![ReplayRecord::Calibration(point)]
    }

    fn initial_calibration(
        &mut self,
        at: DateTime<Utc>,
        first_bg: f64,
        second_bg: f64,
    ) -> Vec<ReplayRecord> {
        let result = self.calibrator.initial_calibration(InitialCalibrationInput {
            first_value: first_bg,
            first_timestamp: at,
            second_value: second_bg,
            sensor: self.sensor.as_ref(),
            recent_zero_readings: self.readings.make_contiguous(),
            device_name: None,
        });
        let Some((first, second)) = result else {
            warn!(first_bg, second_bg, "Initial calibration not possible yet");
            return Vec::new();
        };
        self.push_calibration(first.clone());
        self.push_calibration(second.clone());
        vec![
            ReplayRecord::Calibration(first),
            ReplayRecord::Calibration(second),
        ]
    }

    fn push_calibration(&mut self, point: CalibrationPoint) {
        if self.first_calibration.is_none() {
            self.first_calibration = Some(point.clone());
        }
        self.calibrations.push_front(point);
        self.calibrations.truncate(MAX_CALIBRATIONS);
        self.stats.calibrations += 1;
    }

    fn handle_fragment(&mut self, at: DateTime<Utc>, bytes: &[u8]) -> Vec<ReplayRecord> {
        let instant = self.instant_for(at);
        if !self.reassembler.add_fragment_at(bytes, instant) || !self.reassembler.is_complete() {
            return Vec::new();
        }
        let opcode = self.reassembler.opcode().unwrap_or_default();
        let text = self.reassembler.get_complete_text();
        self.reassembler.reset();
        match text {
            Some(text) => {
                info!(opcode, %text, "Reassembled message");
                vec![ReplayRecord::Message { opcode, text }]
            }
            None => {
                warn!(opcode, "Reassembled message is not UTF-8");
                Vec::new()
            }
        }
    }

    fn instant_for(&mut self, at: DateTime<Utc>) -> Instant {
        let (origin_at, origin) = *self.origin.get_or_insert_with(|| (at, Instant::now()));
        origin + (at - origin_at).to_std().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use gluco_core::reassembly::split_into_fragments;
    use gluco_core::wire::dexcom::TransmitterTimeRx;
    use gluco_core::{CalibratorVariant, TransmitterMessage};

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn sensor_data(seconds: u32, raw: u32) -> String {
        hex::encode(
            SensorDataRx {
                status: 0,
                timestamp: seconds,
                unfiltered: raw,
                filtered: Some(raw),
            }
            .encode(),
        )
    }

    fn session() -> Session {
        Session::new(&CoreConfig::default())
    }

    #[test]
    fn test_readings_then_calibration() {
        let mut session = session();
        session
            .handle(ReplayEvent::SensorStart {
                at: at(-3 * 24 * 60),
            })
            .unwrap();

        let time = TransmitterTimeRx {
            status: 0,
            current_time: 1_000_000,
            session_start_time: 0xFFFF_FFFF,
        };
        session
            .handle(ReplayEvent::Packet {
                at: at(0),
                hex: hex::encode(time.encode()),
            })
            .unwrap();

        let records = session
            .handle(ReplayEvent::Packet {
                at: at(0),
                hex: sensor_data(1_000_000, 120_000),
            })
            .unwrap();
        let [ReplayRecord::Reading(reading)] = records.as_slice() else {
            panic!("expected one reading, got {records:?}");
        };
        assert_eq!(reading.timestamp, at(0));
        assert!((reading.calculated_value - 120_000.0).abs() < f64::EPSILON);

        let records = session
            .handle(ReplayEvent::Calibration {
                at: at(1),
                bg: 110.0,
                second_bg: None,
            })
            .unwrap();
        assert!(matches!(records.as_slice(), [ReplayRecord::Calibration(_)]));

        let records = session
            .handle(ReplayEvent::Packet {
                at: at(5),
                hex: sensor_data(1_000_300, 122_000),
            })
            .unwrap();
        let [ReplayRecord::Reading(reading)] = records.as_slice() else {
            panic!("expected one reading, got {records:?}");
        };
        assert!((reading.calculated_value - 112.0).abs() < 1e-6);
        assert_eq!(
            session.stats(),
            ReplayStats {
                events: 5,
                rejected_packets: 0,
                readings: 2,
                calibrations: 1,
            }
        );
    }

    #[test]
    fn test_corrupt_packet_is_counted() {
        let mut session = session();
        let mut bytes = hex::decode(sensor_data(10, 100_000)).unwrap();
        bytes[3] ^= 0xFF;
        let records = session
            .handle(ReplayEvent::Packet {
                at: at(0),
                hex: hex::encode(bytes),
            })
            .unwrap();
        assert!(records.is_empty());
        assert_eq!(session.stats().rejected_packets, 1);
    }

    #[test]
    fn test_invalid_hex_is_an_error() {
        let mut session = session();
        assert!(session
            .handle(ReplayEvent::Packet {
                at: at(0),
                hex: "zz".into(),
            })
            .is_err());
    }

    #[test]
    fn test_calibration_without_sensor_is_skipped() {
        let mut session = session();
        let records = session
            .handle(ReplayEvent::Calibration {
                at: at(0),
                bg: 100.0,
                second_bg: None,
            })
            .unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_initial_calibration_from_two_finger_sticks() {
        let mut session = session();
        session
            .handle(ReplayEvent::SensorStart {
                at: at(-3 * 24 * 60),
            })
            .unwrap();
        for (i, raw) in [100_000, 150_000].into_iter().enumerate() {
            let minutes = 5 * i64::try_from(i).unwrap();
            session
                .handle(ReplayEvent::Packet {
                    at: at(minutes),
                    hex: sensor_data(u32::try_from(minutes * 60).unwrap(), raw),
                })
                .unwrap();
        }
        let records = session
            .handle(ReplayEvent::Calibration {
                at: at(0),
                bg: 100.0,
                second_bg: Some(150.0),
            })
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(session.stats().calibrations, 2);
    }

    #[test]
    fn test_fragments_reassemble() {
        let mut config = CoreConfig::default();
        config.transmitter.calibrator = CalibratorVariant::NoCalibration;
        let mut session = Session::new(&config);
        let fragments = split_into_fragments(0x0A, b"sensor warmup done", 8).unwrap();
        let mut records = Vec::new();
        for (i, fragment) in fragments.iter().enumerate() {
            let offset = Duration::milliseconds(50 * i64::try_from(i).unwrap());
            records.extend(
                session
                    .handle(ReplayEvent::Fragment {
                        at: at(0) + offset,
                        hex: hex::encode(fragment),
                    })
                    .unwrap(),
            );
        }
        assert_eq!(
            records,
            vec![ReplayRecord::Message {
                opcode: 0x0A,
                text: "sensor warmup done".into()
            }]
        );
    }
}
