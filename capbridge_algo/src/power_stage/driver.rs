// Hardware seam for the bridge power stage. The control core only ever
// talks to this trait; the drivers crate translates it to timer compare
// registers, gate-driver enables and the current-reference DAC.

/// Bridge legs of the four-switch converter.
#[derive(Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum Leg {
    /// Half-bridge on the referee/chassis bus.
    Primary,
    /// Half-bridge on the capacitor bank.
    Secondary,
}

/// Operations the control core may request from the power stage.
///
/// `set_leg_duty_limit` bounds the conduction window of one leg as fractions
/// of the switching period; `hold_leg_on` parks a leg fully conducting. Both
/// are re-issued every fast tick for the active topology, including while
/// output is disabled, so the limits are always programmed before the next
/// enable.
pub trait PowerStageDriver {
    fn set_leg_duty_limit(&mut self, leg: Leg, low: f32, high: f32);
    fn hold_leg_on(&mut self, leg: Leg);

    /// Starts the main output group. Returns false while the stage timer is
    /// not running and the request was ignored.
    fn enable_main(&mut self) -> bool;
    fn disable_main(&mut self);

    /// Starts the auxiliary output group at the given initial duty.
    fn enable_aux(&mut self, duty: f32) -> bool;
    fn disable_aux(&mut self);
    fn set_aux_duty(&mut self, duty: f32);

    /// Programs the peak/valley current reference for the current-mode
    /// comparators, in amperes.
    fn set_current_reference(&mut self, amps: f32);
}
