// Copyright 2024-2026 VRAM-CORE Contributors
// Licensed under the Apache License, Version 2.0

//! Frame access pattern classification and next-frame prediction.
//!
//! The analyzer keeps a bounded ring of recent frame accesses and classifies
//! it as sequential playback, strided access (every Nth frame), a burst of
//! scrubbing around one spot, or random seeking. Classification order is
//! Sequential, Predictable, Burst; the first that reaches the confidence
//! threshold wins, otherwise the pattern is Random and prefetching is off.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Detected access pattern class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternType {
    Sequential,
    #[default]
    Random,
    Predictable,
    Burst,
}

/// Analyzer tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Number of recent accesses kept and analyzed.
    pub window: usize,
    /// Minimum confidence for any non-random classification.
    pub confidence_threshold: f32,
    /// Fraction of deltas that must share one small step for Sequential.
    pub sequential_ratio: f32,
    /// Largest |delta| still treated as sequential playback.
    pub max_sequential_delta: i64,
    pub burst_min_accesses: usize,
    pub burst_time_window_ms: u64,
    pub burst_frame_range: u32,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            window: 32,
            confidence_threshold: 0.6,
            sequential_ratio: 0.8,
            max_sequential_delta: 2,
            burst_min_accesses: 8,
            burst_time_window_ms: 500,
            burst_frame_range: 32,
        }
    }
}

/// Result of the latest classification.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AccessPattern {
    pub pattern_type: PatternType,
    pub confidence: f32,
    /// Analyzed frames, oldest first.
    pub recent_frames: Vec<u32>,
    pub predicted_next_frame: Option<u32>,
    /// Step between accesses for Sequential and Predictable.
    pub stride: i64,
}

struct AnalyzerState {
    history: VecDeque<(u32, Instant)>,
    pattern: AccessPattern,
}

/// Thread-safe access pattern analyzer.
pub struct AccessPatternAnalyzer {
    config: PatternConfig,
    state: Mutex<AnalyzerState>,
}

impl AccessPatternAnalyzer {
    pub fn new(config: PatternConfig) -> Self {
        let window = config.window.max(2);
        Self {
            config: PatternConfig { window, ..config },
            state: Mutex::new(AnalyzerState {
                history: VecDeque::with_capacity(window),
                pattern: AccessPattern::default(),
            }),
        }
    }

    pub fn config(&self) -> &PatternConfig {
        &self.config
    }

    /// Record an access now and re-classify.
    pub fn record_access(&self, frame: u32) -> AccessPattern {
        self.record_access_at(frame, Instant::now())
    }

    /// Record an access with an explicit timestamp and re-classify.
    pub fn record_access_at(&self, frame: u32, at: Instant) -> AccessPattern {
        let mut state = self.state.lock();
        if state.history.len() == self.config.window {
            state.history.pop_front();
        }
        state.history.push_back((frame, at));

        let frames: Vec<u32> = state.history.iter().map(|(f, _)| *f).collect();
        let times: Vec<Instant> = state.history.iter().map(|(_, t)| *t).collect();
        let pattern = classify(&self.config, &frames, Some(&times));
        state.pattern = pattern.clone();
        pattern
    }

    /// Classify an externally supplied history, replacing the stored one.
    ///
    /// Without timestamps every supplied access counts as recent for burst
    /// detection.
    pub fn analyze_recent_access(&self, history: &[u32]) -> AccessPattern {
        let start = history.len().saturating_sub(self.config.window);
        let frames = &history[start..];
        let pattern = classify(&self.config, frames, None);

        let now = Instant::now();
        let mut state = self.state.lock();
        state.history = frames.iter().map(|f| (*f, now)).collect();
        state.pattern = pattern.clone();
        pattern
    }

    pub fn predict_next_access(&self) -> Option<u32> {
        self.state.lock().pattern.predicted_next_frame
    }

    /// Up to `lookahead` frames expected next, nearest first.
    pub fn predicted_frames(&self, lookahead: usize) -> Vec<u32> {
        let state = self.state.lock();
        let pattern = &state.pattern;
        let Some(&last) = pattern.recent_frames.last() else {
            return Vec::new();
        };

        match pattern.pattern_type {
            PatternType::Random => Vec::new(),
            PatternType::Sequential | PatternType::Predictable => (1..=lookahead as i64)
                .map_while(|i| u32::try_from(last as i64 + pattern.stride * i).ok())
                .collect(),
            PatternType::Burst => {
                burst_candidates(&self.config, &pattern.recent_frames, last, lookahead)
            }
        }
    }

    pub fn prefetch_enabled(&self) -> bool {
        self.state.lock().pattern.pattern_type != PatternType::Random
    }

    pub fn pattern(&self) -> AccessPattern {
        self.state.lock().pattern.clone()
    }

    /// Forget history and confidence (after a seek).
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.history.clear();
        state.pattern = AccessPattern::default();
    }
}

fn classify(config: &PatternConfig, frames: &[u32], times: Option<&[Instant]>) -> AccessPattern {
    let mut pattern = AccessPattern {
        recent_frames: frames.to_vec(),
        ..AccessPattern::default()
    };
    let Some(&last) = frames.last() else {
        return pattern;
    };

    let deltas: Vec<i64> = frames.windows(2).map(|w| w[1] as i64 - w[0] as i64).collect();
    if deltas.is_empty() {
        return pattern;
    }
    let weight = (deltas.len() as f32 / 3.0).min(1.0);

    // Sequential: one small non-zero step dominates.
    if let Some((step, count)) = mode(deltas.iter().filter(|d| {
        **d != 0 && d.abs() <= config.max_sequential_delta
    })) {
        let fraction = count as f32 / deltas.len() as f32;
        let confidence = fraction * weight;
        if fraction >= config.sequential_ratio && confidence >= config.confidence_threshold {
            pattern.pattern_type = PatternType::Sequential;
            pattern.confidence = confidence;
            pattern.stride = step;
            pattern.predicted_next_frame = u32::try_from(last as i64 + step).ok();
            return pattern;
        }
    }

    // Predictable: a recurring larger stride.
    if let Some((stride, count)) = mode(deltas.iter().filter(|d| d.abs() > config.max_sequential_delta)) {
        let fraction = count as f32 / deltas.len() as f32;
        let confidence = fraction * weight;
        if confidence >= config.confidence_threshold {
            pattern.pattern_type = PatternType::Predictable;
            pattern.confidence = confidence;
            pattern.stride = stride;
            pattern.predicted_next_frame = u32::try_from(last as i64 + stride).ok();
            return pattern;
        }
    }

    // Burst: many recent accesses clustered in a narrow frame range.
    let recent: &[u32] = match times {
        Some(times) => {
            let window = Duration::from_millis(config.burst_time_window_ms);
            let newest = times[times.len() - 1];
            let first = times
                .iter()
                .position(|t| newest.saturating_duration_since(*t) <= window)
                .unwrap_or(times.len() - 1);
            &frames[first..]
        }
        None => frames,
    };
    if recent.len() >= config.burst_min_accesses.max(2) {
        let lo = recent.iter().copied().min().unwrap_or(last);
        let hi = recent.iter().copied().max().unwrap_or(last);
        if hi - lo <= config.burst_frame_range {
            let inside = frames.iter().filter(|f| (lo..=hi).contains(*f)).count();
            let confidence = inside as f32 / frames.len() as f32 * weight;
            if confidence >= config.confidence_threshold {
                pattern.pattern_type = PatternType::Burst;
                pattern.confidence = confidence;
                pattern.predicted_next_frame =
                    burst_candidates(config, recent, last, 1).first().copied();
                return pattern;
            }
        }
    }

    pattern.confidence = 0.0;
    pattern
}

/// Most frequent value and its count; ties go to the most recent value.
fn mode<'a>(values: impl Iterator<Item = &'a i64>) -> Option<(i64, usize)> {
    let mut counts: HashMap<i64, (usize, usize)> = HashMap::new();
    for (pos, v) in values.enumerate() {
        let e = counts.entry(*v).or_insert((0, 0));
        e.0 += 1;
        e.1 = pos;
    }
    counts
        .into_iter()
        .max_by_key(|(_, (count, pos))| (*count, *pos))
        .map(|(v, (count, _))| (v, count))
}

/// Unseen frames in the burst range, nearest to `last` first, forward on ties.
fn burst_candidates(config: &PatternConfig, frames: &[u32], last: u32, limit: usize) -> Vec<u32> {
    let seen: HashSet<u32> = frames.iter().copied().collect();
    let lo = frames.iter().copied().min().unwrap_or(last);
    let hi = frames.iter().copied().max().unwrap_or(last);

    let mut out = Vec::with_capacity(limit);
    for d in 1..=config.burst_frame_range.max(1) {
        if out.len() >= limit {
            break;
        }
        let forward = last.saturating_add(d);
        if forward <= hi && !seen.contains(&forward) {
            out.push(forward);
        }
        if out.len() >= limit {
            break;
        }
        if let Some(back) = last.checked_sub(d) {
            if back >= lo && !seen.contains(&back) {
                out.push(back);
            }
        }
    }
    if out.is_empty() && limit > 0 {
        out.push(hi.saturating_add(1));
    }
    out
}
