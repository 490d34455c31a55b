use libp2p::{gossipsub, identify, mdns, swarm::NetworkBehaviour};

#[derive(NetworkBehaviour)]
pub struct CowatchBehaviour {
    pub gossipsub: gossipsub::Behaviour,
    pub mdns: mdns::tokio::Behaviour,
    pub identify: identify::Behaviour,
}
