//! Time management
//!
//! Computes the optimum and maximum budgets for the current move from
//! the clock state and regime (sudden-death/Fischer vs X-moves-in-Y),
//! and supports the "nodes as time" virtual clock.

use std::time::Instant;

use crate::types::Color;

use super::LimitsType;

/// Milliseconds (or virtual node-milliseconds in nodes-as-time mode)
pub type TimePoint = i64;

/// Engine options the time manager consumes
#[derive(Debug, Clone, Copy)]
pub struct TimeOptions {
    /// Compensation for I/O latency, in ms
    pub move_overhead: TimePoint,
    /// Nodes per millisecond; non-zero switches to virtual time
    pub nodestime: TimePoint,
    pub ponder: bool,
}

impl Default for TimeOptions {
    fn default() -> Self {
        TimeOptions {
            move_overhead: 10,
            nodestime: 0,
            ponder: false,
        }
    }
}

/// Per-move time budgets
pub struct TimeManagement {
    start_time: Instant,
    optimum_time: TimePoint,
    maximum_time: TimePoint,
    /// Remaining virtual node pool; -1 means not yet initialized
    available_nodes: i64,
    use_nodes_time: bool,
}

impl TimeManagement {
    pub fn new() -> TimeManagement {
        TimeManagement {
            start_time: Instant::now(),
            optimum_time: 0,
            maximum_time: 0,
            available_nodes: -1,
            use_nodes_time: false,
        }
    }

    #[inline]
    pub fn optimum(&self) -> TimePoint {
        self.optimum_time
    }

    #[inline]
    pub fn maximum(&self) -> TimePoint {
        self.maximum_time
    }

    /// Reset the virtual node pool (new game)
    pub fn clear(&mut self) {
        self.available_nodes = -1;
    }

    /// Consume searched nodes from the per-game pool
    pub fn advance_nodes_time(&mut self, nodes: i64) {
        debug_assert!(self.use_nodes_time);
        self.available_nodes = (self.available_nodes - nodes).max(0);
    }

    /// Elapsed search effort: wall time, or node count in nodes-as-time
    /// mode (`nodes` is sampled lazily).
    pub fn elapsed<F: FnOnce() -> u64>(&self, nodes: F) -> TimePoint {
        if self.use_nodes_time {
            nodes() as TimePoint
        } else {
            self.elapsed_time()
        }
    }

    /// Wall-clock elapsed since `init`
    pub fn elapsed_time(&self) -> TimePoint {
        self.start_time.elapsed().as_millis() as TimePoint
    }

    /// Compute the budgets for this move. May rewrite `limits` when
    /// nodes-as-time is active.
    pub fn init(
        &mut self,
        limits: &mut LimitsType,
        us: Color,
        ply: i32,
        options: &TimeOptions,
        original_time_adjust: &mut f64,
    ) {
        let npmsec = options.nodestime;
        self.start_time = limits.start_time;
        self.use_nodes_time = npmsec != 0;

        if limits.time[us.index()] == 0 {
            return;
        }

        let mut move_overhead = options.move_overhead;

        if self.use_nodes_time {
            // Only convert the clock once per game
            if self.available_nodes == -1 {
                self.available_nodes = npmsec * limits.time[us.index()];
            }
            limits.time[us.index()] = self.available_nodes;
            limits.inc[us.index()] *= npmsec;
            limits.npmsec = npmsec;
            move_overhead *= npmsec;
        }

        let scale_factor: i64 = if self.use_nodes_time { npmsec } else { 1 };
        let scaled_time = limits.time[us.index()] / scale_factor;
        let scaled_inc = limits.inc[us.index()] / scale_factor;

        let mut mtg: i32 = if limits.movestogo != 0 {
            limits.movestogo.min(60)
        } else {
            60
        };

        // With almost no time left, plan for fewer moves
        if scaled_time < 1000 && (mtg as f64) / scaled_inc.max(1) as f64 > 0.05 {
            mtg = (scaled_time as f64 * 0.05) as i32;
            mtg = mtg.max(1);
        }

        let time_left: i64 = (limits.time[us.index()]
            + limits.inc[us.index()] * (mtg as i64 - 1)
            - move_overhead * (2 + mtg as i64))
            .max(1);

        let (opt_scale, max_scale);

        if limits.movestogo == 0 {
            // Sudden death or Fischer
            if *original_time_adjust < 0.0 {
                *original_time_adjust = 0.3285 * (time_left as f64).log10() - 0.4830;
            }

            let log_time_sec = (scaled_time as f64 / 1000.0).log10();
            let opt_constant = (0.00344 + 0.000200 * log_time_sec).min(0.00450);
            let max_constant = (3.90 + 3.10 * log_time_sec).max(2.50);

            opt_scale = ((0.0155 + (ply as f64 + 3.0).powf(0.45) * opt_constant)
                .min(0.2 * limits.time[us.index()] as f64 / time_left as f64))
                * *original_time_adjust;
            max_scale = (max_constant + ply as f64 / 13.6).min(6.5);
        } else {
            // X moves in Y time
            opt_scale = ((0.88 + ply as f64 / 116.4) / mtg as f64)
                .min(0.88 * limits.time[us.index()] as f64 / time_left as f64);
            max_scale = (1.5 + 0.11 * mtg as f64).min(6.3);
        }

        self.optimum_time = (opt_scale * time_left as f64) as TimePoint;
        self.maximum_time = ((0.81 * limits.time[us.index()] as f64 - move_overhead as f64)
            .min(max_scale * self.optimum_time as f64)) as TimePoint
            - 10;

        if options.ponder {
            self.optimum_time += self.optimum_time / 4;
        }
    }
}

impl Default for TimeManagement {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits_with_time(ms: i64, inc: i64, movestogo: i32) -> LimitsType {
        LimitsType {
            time: [ms, ms],
            inc: [inc, inc],
            movestogo,
            ..LimitsType::default()
        }
    }

    #[test]
    fn test_budgets_positive_and_ordered() {
        let mut tm = TimeManagement::new();
        let mut limits = limits_with_time(60_000, 1000, 0);
        let mut adjust = -1.0;
        tm.init(&mut limits, Color::White, 20, &TimeOptions::default(), &mut adjust);
        assert!(tm.optimum() > 0);
        assert!(tm.maximum() >= tm.optimum());
        assert!(adjust > 0.0);
    }

    #[test]
    fn test_maximum_bounded_by_remaining_time() {
        let mut tm = TimeManagement::new();
        let mut limits = limits_with_time(5_000, 0, 0);
        let mut adjust = -1.0;
        tm.init(&mut limits, Color::White, 40, &TimeOptions::default(), &mut adjust);
        assert!(tm.maximum() < 5_000);
    }

    #[test]
    fn test_moves_to_go_regime() {
        let mut tm = TimeManagement::new();
        let mut limits = limits_with_time(60_000, 0, 40);
        let mut adjust = -1.0;
        tm.init(&mut limits, Color::White, 0, &TimeOptions::default(), &mut adjust);
        // Roughly a fortieth of the clock, never more than the max
        assert!(tm.optimum() >= 60_000 / 40 / 2);
        assert!(tm.optimum() <= 60_000 / 10);
        assert!(tm.maximum() >= tm.optimum());
    }

    #[test]
    fn test_more_time_gives_bigger_budget() {
        let opts = TimeOptions::default();
        let mut tm1 = TimeManagement::new();
        let mut l1 = limits_with_time(10_000, 0, 0);
        let mut a1 = -1.0;
        tm1.init(&mut l1, Color::White, 10, &opts, &mut a1);
        let mut tm2 = TimeManagement::new();
        let mut l2 = limits_with_time(600_000, 0, 0);
        let mut a2 = -1.0;
        tm2.init(&mut l2, Color::White, 10, &opts, &mut a2);
        assert!(tm2.optimum() > tm1.optimum());
        assert!(tm2.maximum() > tm1.maximum());
    }

    #[test]
    fn test_ponder_bonus() {
        let mut base = TimeManagement::new();
        let mut l = limits_with_time(60_000, 0, 0);
        let mut a = -1.0;
        base.init(&mut l, Color::White, 10, &TimeOptions::default(), &mut a);

        let mut pondering = TimeManagement::new();
        let mut l2 = limits_with_time(60_000, 0, 0);
        let mut a2 = -1.0;
        let opts = TimeOptions {
            ponder: true,
            ..TimeOptions::default()
        };
        pondering.init(&mut l2, Color::White, 10, &opts, &mut a2);
        assert!(pondering.optimum() > base.optimum());
    }

    #[test]
    fn test_nodes_as_time_pool() {
        let mut tm = TimeManagement::new();
        let opts = TimeOptions {
            nodestime: 100,
            ..TimeOptions::default()
        };
        let mut limits = limits_with_time(1_000, 0, 0);
        let mut adjust = -1.0;
        tm.init(&mut limits, Color::White, 0, &opts, &mut adjust);
        // The clock was converted into a virtual node pool
        assert_eq!(tm.available_nodes, 100 * 1_000);
        assert_eq!(limits.time[0], 100_000);
        tm.advance_nodes_time(40_000);
        assert_eq!(tm.available_nodes, 60_000);
        // Elapsed is measured in nodes now
        assert_eq!(tm.elapsed(|| 777), 777);
    }

    #[test]
    fn test_no_time_no_budget() {
        let mut tm = TimeManagement::new();
        let mut limits = LimitsType::default();
        let mut adjust = -1.0;
        tm.init(&mut limits, Color::White, 0, &TimeOptions::default(), &mut adjust);
        assert_eq!(tm.optimum(), 0);
        assert_eq!(tm.maximum(), 0);
    }
}
