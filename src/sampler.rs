//! Periodic status sampling.

use tracing::debug;

use crate::{
    clock::{Clock, Instant, saturating_since},
    error::{Error, Result},
    link::{DeviceLink, Transport},
    packet::{HEATING_QUERY, STATUS_QUERY, STATUS_REPLY_LEN, StatusReply, decode_heating, decode_status},
    telemetry::{LiveDisplay, StatusSample, TelemetrySink},
};

/// Read the device's current setpoints and measurements.
pub fn query_status<S, C>(link: &mut DeviceLink<S, C>) -> Result<StatusReply, S::Error>
where
    S: Transport,
    C: Clock,
{
    let reply = link.query(&STATUS_QUERY, STATUS_REPLY_LEN)?;
    Ok(decode_status(&reply)?)
}

/// Read whether the heating relay is energized.
pub fn query_heating<S, C>(link: &mut DeviceLink<S, C>) -> Result<bool, S::Error>
where
    S: Transport,
    C: Clock,
{
    let reply = link.query(&HEATING_QUERY, STATUS_REPLY_LEN)?;
    Ok(decode_heating(&reply)?)
}

/// Takes [`StatusSample`]s and appends them to a sink and a display.
pub struct StatusSampler<K: TelemetrySink, D: LiveDisplay> {
    start: Instant,
    sink: K,
    display: D,
    last: Option<StatusSample>,
    taken: usize,
}

impl<K: TelemetrySink, D: LiveDisplay> StatusSampler<K, D> {
    /// Elapsed times are measured from `start`.
    pub fn new(start: Instant, sink: K, display: D) -> Self {
        Self {
            start,
            sink,
            display,
            last: None,
            taken: 0,
        }
    }

    pub fn restart(&mut self, start: Instant) {
        self.start = start;
    }

    /// Two round trips: general status, then heating state.
    ///
    /// A short reply on either query is returned as [`Error::Timeout`] and
    /// nothing is recorded; there is no retry here.
    pub fn sample<S, C>(&mut self, link: &mut DeviceLink<S, C>) -> Result<StatusSample, S::Error>
    where
        S: Transport,
        C: Clock,
    {
        let status = query_status(link)?;
        // timestamped when the measurement arrives
        let elapsed = saturating_since(link.now(), self.start);
        let heating_on = query_heating(link)?;

        let sample = StatusSample {
            elapsed_seconds: elapsed.to_millis() as f64 / 1000.0,
            set_temperature: status.set_temperature,
            measured_temperature: status.measured_temperature,
            set_speed: status.set_speed,
            measured_speed: status.measured_speed,
            heating_on,
        };
        debug!(?sample, "Sample");

        self.sink.record(&sample).map_err(Error::Log)?;
        self.display.show(&sample);
        self.last = Some(sample);
        self.taken += 1;
        Ok(sample)
    }

    /// The most recent good sample.
    pub fn last(&self) -> Option<&StatusSample> {
        self.last.as_ref()
    }

    /// Number of samples recorded.
    pub fn taken(&self) -> usize {
        self.taken
    }

    pub fn flush(&mut self) -> std::io::Result<()> {
        self.sink.flush()
    }

    pub fn sink(&self) -> &K {
        &self.sink
    }

    pub fn into_sink(self) -> K {
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::Duration,
        init_table::tests::sample_table,
        mock_serial::{MockHotplate, VirtualClock},
    };

    fn ready_link(device: MockHotplate) -> DeviceLink<MockHotplate, VirtualClock> {
        let mut link = DeviceLink::new(device, VirtualClock::new());
        link.initialize(&sample_table()).unwrap();
        link
    }

    #[test]
    fn sample_decodes_both_queries() {
        let mut device = MockHotplate::with_setpoints(215, 300);
        device.set_heating(false);
        let mut link = ready_link(device);
        let start = link.now();
        let mut sampler = StatusSampler::new(start, Vec::new(), ());

        let sample = sampler.sample(&mut link).unwrap();
        assert_eq!(sample.set_temperature, 215);
        assert_eq!(sample.measured_temperature, 215);
        assert_eq!(sample.set_speed, 300);
        assert!(!sample.heating_on);
        // one 6-byte query at 50 ms per byte
        assert_eq!(sample.elapsed_seconds, 0.3);

        assert_eq!(sampler.sink(), &vec![sample]);
        assert_eq!(sampler.last(), Some(&sample));
        assert_eq!(link.interface().unwrap().query_count(), 2);
    }

    #[test]
    fn short_status_reply_is_not_recorded() {
        let mut device = MockHotplate::new();
        device.truncate_next_reply(4);
        let mut link = ready_link(device);
        let mut sampler = StatusSampler::new(link.now(), Vec::new(), ());

        let result = sampler.sample(&mut link);
        assert!(matches!(
            result,
            Err(Error::Timeout {
                expected: 11,
                received: 4
            })
        ));
        assert!(sampler.sink().is_empty());
        assert_eq!(sampler.taken(), 0);

        // The next query resynchronizes.
        assert!(sampler.sample(&mut link).is_ok());
    }

    #[test]
    fn short_heating_reply_is_not_recorded() {
        let mut device = MockHotplate::new();
        // reply 0 answers the status query, reply 1 the heating query
        device.truncate_reply(1, 5);
        let mut link = ready_link(device);
        let mut sampler = StatusSampler::new(link.now(), Vec::new(), ());

        let result = sampler.sample(&mut link);
        assert!(matches!(
            result,
            Err(Error::Timeout {
                expected: 11,
                received: 5
            })
        ));
        assert!(sampler.sink().is_empty());
        assert!(sampler.last().is_none());
        assert_eq!(sampler.taken(), 0);

        assert!(sampler.sample(&mut link).is_ok());
        assert_eq!(sampler.taken(), 1);
    }

    #[test]
    fn late_tail_costs_one_sample_only() {
        let mut device = MockHotplate::with_setpoints(215, 300);
        device.delay_reply_tail(0, 4);
        let mut link = ready_link(device);
        let mut sampler = StatusSampler::new(link.now(), Vec::new(), ());

        assert!(matches!(sampler.sample(&mut link), Err(Error::Timeout { .. })));
        assert!(matches!(
            sampler.sample(&mut link),
            Err(Error::InvalidResponse { .. })
        ));
        let sample = sampler.sample(&mut link).unwrap();
        assert_eq!(sample.set_temperature, 215);
        assert_eq!(sample.set_speed, 300);
        assert_eq!(sampler.sink(), &vec![sample]);
    }

    #[test]
    fn elapsed_is_relative_to_start() {
        let mut link = ready_link(MockHotplate::new());
        let start = link.now();
        link.delay(Duration::millis(2_000));
        let mut sampler = StatusSampler::new(start, Vec::new(), ());
        let sample = sampler.sample(&mut link).unwrap();
        assert_eq!(sample.elapsed_seconds, 2.3);
    }
}
