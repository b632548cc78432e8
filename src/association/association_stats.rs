/// Counters of one association.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub struct AssociationStats {
    n_datas_sent: u64,
    n_datas_received: u64,
    n_sacks_sent: u64,
    n_sacks_received: u64,
    n_t3timeouts: u64,
    n_ack_timeouts: u64,
    n_fast_retrans: u64,
    n_dropped_packets: u64,
}

impl AssociationStats {
    pub(crate) fn inc_datas_sent(&mut self) {
        self.n_datas_sent += 1;
    }

    pub fn get_num_datas_sent(&self) -> u64 {
        self.n_datas_sent
    }

    pub(crate) fn inc_datas_received(&mut self) {
        self.n_datas_received += 1;
    }

    pub fn get_num_datas_received(&self) -> u64 {
        self.n_datas_received
    }

    pub(crate) fn inc_sacks_sent(&mut self) {
        self.n_sacks_sent += 1;
    }

    pub fn get_num_sacks_sent(&self) -> u64 {
        self.n_sacks_sent
    }

    pub(crate) fn inc_sacks_received(&mut self) {
        self.n_sacks_received += 1;
    }

    pub fn get_num_sacks_received(&self) -> u64 {
        self.n_sacks_received
    }

    pub(crate) fn inc_t3timeouts(&mut self) {
        self.n_t3timeouts += 1;
    }

    pub fn get_num_t3timeouts(&self) -> u64 {
        self.n_t3timeouts
    }

    pub(crate) fn inc_ack_timeouts(&mut self) {
        self.n_ack_timeouts += 1;
    }

    pub fn get_num_ack_timeouts(&self) -> u64 {
        self.n_ack_timeouts
    }

    pub(crate) fn inc_fast_retrans(&mut self) {
        self.n_fast_retrans += 1;
    }

    pub fn get_num_fast_retrans(&self) -> u64 {
        self.n_fast_retrans
    }

    pub(crate) fn inc_dropped_packets(&mut self) {
        self.n_dropped_packets += 1;
    }

    pub fn get_num_dropped_packets(&self) -> u64 {
        self.n_dropped_packets
    }

    pub fn reset(&mut self) {
        *self = AssociationStats::default();
    }
}
