use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use libp2p::futures::StreamExt;
use libp2p::gossipsub::TopicHash;
use libp2p::identity::Keypair;
use libp2p::{
    gossipsub, identify, mdns, noise, swarm::SwarmEvent, tcp, yamux, Multiaddr, PeerId, Swarm,
    SwarmBuilder,
};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::NetworkConfig;
use crate::error::TransportError;
use crate::models::{PresenceMeta, RoomEvent};
use crate::network::behaviour::{CowatchBehaviour, CowatchBehaviourEvent};
use crate::network::{ChannelFrame, NetworkCommand, RoomTransport, TransportEvent, EVENT_QUEUE};

const PROTOCOL_VERSION: &str = "cowatch/0.1.0";

pub fn build_swarm(
    keypair: &Keypair,
    config: &NetworkConfig,
) -> Result<Swarm<CowatchBehaviour>, Box<dyn std::error::Error>> {
    let peer_id = PeerId::from(keypair.public());

    let gossipsub_config = gossipsub::ConfigBuilder::default()
        .heartbeat_interval(Duration::from_secs(config.heartbeat_secs.max(1)))
        .validation_mode(gossipsub::ValidationMode::Strict)
        .mesh_n(2)
        .mesh_n_low(1)
        .mesh_n_high(4)
        .mesh_outbound_min(1)
        .flood_publish(true)
        .build()
        .map_err(|e| format!("GossipSub config error: {}", e))?;

    let gossipsub = gossipsub::Behaviour::new(
        gossipsub::MessageAuthenticity::Signed(keypair.clone()),
        gossipsub_config,
    )
    .map_err(|e| format!("GossipSub behaviour error: {}", e))?;

    // mDNS for LAN discovery
    let mdns = mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id)?;

    let identify = identify::Behaviour::new(identify::Config::new(
        PROTOCOL_VERSION.to_string(),
        keypair.public(),
    ));

    let swarm = SwarmBuilder::with_existing_identity(keypair.clone())
        .with_tokio()
        .with_tcp(
            tcp::Config::default(),
            noise::Config::new,
            yamux::Config::default,
        )?
        .with_quic()
        .with_behaviour(|_key| {
            Ok(CowatchBehaviour {
                gossipsub,
                mdns,
                identify,
            })
        })?
        .with_swarm_config(|c: libp2p::swarm::Config| {
            c.with_idle_connection_timeout(Duration::from_secs(60))
        })
        .build();

    Ok(swarm)
}

/// Handle to the swarm event loop; cheap to clone.
#[derive(Clone)]
pub struct SwarmTransport {
    cmd_tx: mpsc::Sender<NetworkCommand>,
}

impl SwarmTransport {
    pub fn new(cmd_tx: mpsc::Sender<NetworkCommand>) -> Self {
        Self { cmd_tx }
    }

    async fn send(&self, cmd: NetworkCommand) -> Result<(), TransportError> {
        self.cmd_tx.send(cmd).await.map_err(|_| TransportError::Closed)
    }
}

#[async_trait]
impl RoomTransport for SwarmTransport {
    async fn subscribe(
        &self,
        room: &str,
        presence: PresenceMeta,
    ) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let (events, rx) = mpsc::channel(EVENT_QUEUE);
        self.send(NetworkCommand::Subscribe {
            room: room.to_string(),
            presence,
            events,
        })
        .await?;
        Ok(rx)
    }

    async fn publish(&self, room: &str, event: RoomEvent) -> Result<(), TransportError> {
        self.send(NetworkCommand::Publish {
            room: room.to_string(),
            event,
        })
        .await
    }

    async fn track(&self, room: &str, presence: PresenceMeta) -> Result<(), TransportError> {
        self.send(NetworkCommand::Track {
            room: room.to_string(),
            presence,
        })
        .await
    }

    async fn unsubscribe(&self, room: &str) -> Result<(), TransportError> {
        self.send(NetworkCommand::Unsubscribe {
            room: room.to_string(),
        })
        .await
    }
}

/// A room this node is subscribed to.
struct RoomSub {
    room: String,
    topic: gossipsub::IdentTopic,
    presence: PresenceMeta,
    events: mpsc::Sender<TransportEvent>,
    /// Last presence tracked by each remote libp2p peer on this topic.
    members: HashMap<PeerId, PresenceMeta>,
}

impl RoomSub {
    fn deliver(&self, event: TransportEvent) {
        if let Err(e) = self.events.try_send(event) {
            warn!("Dropping event for room {}: {}", self.room, e);
        }
    }

    fn forget(&mut self, peer_id: &PeerId) {
        if let Some(meta) = self.members.remove(peer_id) {
            info!("{} ({}) left room {}", meta.name, meta.id, self.room);
            self.deliver(TransportEvent::PresenceLeave(meta));
        }
    }
}

fn publish_frame(swarm: &mut Swarm<CowatchBehaviour>, sub: &RoomSub, frame: &ChannelFrame) {
    let data = match serde_json::to_vec(frame) {
        Ok(data) => data,
        Err(e) => {
            warn!("Failed to encode frame for {}: {}", sub.room, e);
            return;
        }
    };
    if let Err(e) = swarm.behaviour_mut().gossipsub.publish(sub.topic.clone(), data) {
        // InsufficientPeers is routine while alone in a room
        debug!("Publish to {} failed: {}", sub.topic, e);
    }
}

pub async fn run_event_loop(
    mut swarm: Swarm<CowatchBehaviour>,
    mut cmd_rx: mpsc::Receiver<NetworkCommand>,
    config: NetworkConfig,
) {
    for addr in &config.listen {
        match addr.parse::<Multiaddr>() {
            Ok(addr) => {
                if let Err(e) = swarm.listen_on(addr.clone()) {
                    warn!("Failed to listen on {}: {}", addr, e);
                }
            }
            Err(e) => warn!("Invalid listen address {}: {}", addr, e),
        }
    }
    for addr in &config.dial {
        match addr.parse::<Multiaddr>() {
            Ok(addr) => {
                if let Err(e) = swarm.dial(addr.clone()) {
                    warn!("Failed to dial {}: {}", addr, e);
                }
            }
            Err(e) => warn!("Invalid dial address {}: {}", addr, e),
        }
    }

    let mut rooms: HashMap<TopicHash, RoomSub> = HashMap::new();

    loop {
        tokio::select! {
            event = swarm.select_next_some() => {
                match event {
                    SwarmEvent::Behaviour(CowatchBehaviourEvent::Mdns(mdns::Event::Discovered(peers))) => {
                        for (peer_id, addr) in peers {
                            info!("mDNS discovered peer: {} at {}", peer_id, addr);
                            swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
                        }
                    }
                    SwarmEvent::Behaviour(CowatchBehaviourEvent::Mdns(mdns::Event::Expired(peers))) => {
                        for (peer_id, _addr) in peers {
                            info!("mDNS peer expired: {}", peer_id);
                            swarm.behaviour_mut().gossipsub.remove_explicit_peer(&peer_id);
                        }
                    }
                    SwarmEvent::Behaviour(CowatchBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                        message,
                        propagation_source,
                        ..
                    })) => {
                        let Some(sub) = rooms.get_mut(&message.topic) else {
                            continue;
                        };
                        let source = message.source.unwrap_or(propagation_source);
                        let frame = match serde_json::from_slice::<ChannelFrame>(&message.data) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!("Malformed frame on {} from {}: {}", sub.room, source, e);
                                continue;
                            }
                        };
                        match frame {
                            ChannelFrame::Event(event) => {
                                if let Err(e) = event.validate() {
                                    warn!("Rejected {} on {} from {}: {}", event.name(), sub.room, source, e);
                                    continue;
                                }
                                debug!("{} on {} from {}", event.name(), sub.room, source);
                                sub.deliver(TransportEvent::Message(event));
                            }
                            ChannelFrame::Track(meta) => {
                                let previous = sub.members.insert(source, meta.clone());
                                if previous.as_ref() != Some(&meta) {
                                    info!("{} ({}) joined room {}", meta.name, meta.id, sub.room);
                                    if let Some(old) = previous {
                                        sub.deliver(TransportEvent::PresenceLeave(old));
                                    }
                                    sub.deliver(TransportEvent::PresenceJoin(meta));
                                }
                            }
                            ChannelFrame::Untrack(_) => sub.forget(&source),
                        }
                    }
                    SwarmEvent::Behaviour(CowatchBehaviourEvent::Gossipsub(gossipsub::Event::Subscribed {
                        peer_id,
                        topic,
                    })) => {
                        if let Some(sub) = rooms.get(&topic) {
                            debug!("{} subscribed to {}; re-announcing presence", peer_id, sub.room);
                            let frame = ChannelFrame::Track(sub.presence.clone());
                            publish_frame(&mut swarm, sub, &frame);
                        }
                    }
                    SwarmEvent::Behaviour(CowatchBehaviourEvent::Gossipsub(gossipsub::Event::Unsubscribed {
                        peer_id,
                        topic,
                    })) => {
                        if let Some(sub) = rooms.get_mut(&topic) {
                            sub.forget(&peer_id);
                        }
                    }
                    SwarmEvent::Behaviour(CowatchBehaviourEvent::Identify(identify::Event::Received {
                        peer_id,
                        info,
                        ..
                    })) => {
                        info!("Identified peer: {} running {}", peer_id, info.protocol_version);
                    }
                    SwarmEvent::NewListenAddr { address, .. } => {
                        info!("Listening on {}", address);
                    }
                    SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                        info!("Connected to {}", peer_id);
                    }
                    SwarmEvent::ConnectionClosed { peer_id, num_established, .. } => {
                        info!("Disconnected from {}", peer_id);
                        if num_established == 0 {
                            for sub in rooms.values_mut() {
                                sub.forget(&peer_id);
                            }
                        }
                    }
                    _ => {}
                }
            }
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    info!("Network command channel closed; stopping event loop");
                    break;
                };
                match cmd {
                    NetworkCommand::Subscribe { room, presence, events } => {
                        let topic = gossipsub::IdentTopic::new(config.topic_for(&room));
                        if let Err(e) = swarm.behaviour_mut().gossipsub.subscribe(&topic) {
                            warn!("Failed to subscribe to {}: {}", topic, e);
                            continue;
                        }
                        info!("Subscribed to room topic: {}", topic);
                        let sub = RoomSub {
                            room,
                            topic: topic.clone(),
                            presence: presence.clone(),
                            events,
                            members: HashMap::new(),
                        };
                        sub.deliver(TransportEvent::Subscribed);
                        sub.deliver(TransportEvent::PresenceJoin(presence.clone()));
                        publish_frame(&mut swarm, &sub, &ChannelFrame::Track(presence));
                        rooms.insert(topic.hash(), sub);
                    }
                    NetworkCommand::Publish { room, event } => {
                        let hash = gossipsub::IdentTopic::new(config.topic_for(&room)).hash();
                        let Some(sub) = rooms.get(&hash) else {
                            warn!("Publish {} to unsubscribed room {}", event.name(), room);
                            continue;
                        };
                        debug!("Publishing {} to {}", event.name(), sub.room);
                        let frame = ChannelFrame::Event(event);
                        publish_frame(&mut swarm, sub, &frame);
                        if config.self_echo {
                            if let ChannelFrame::Event(event) = frame {
                                sub.deliver(TransportEvent::Message(event));
                            }
                        }
                    }
                    NetworkCommand::Track { room, presence } => {
                        let hash = gossipsub::IdentTopic::new(config.topic_for(&room)).hash();
                        if let Some(sub) = rooms.get_mut(&hash) {
                            sub.presence = presence.clone();
                            let frame = ChannelFrame::Track(presence);
                            publish_frame(&mut swarm, sub, &frame);
                        }
                    }
                    NetworkCommand::Unsubscribe { room } => {
                        let topic = gossipsub::IdentTopic::new(config.topic_for(&room));
                        if let Some(sub) = rooms.remove(&topic.hash()) {
                            let frame = ChannelFrame::Untrack(sub.presence.clone());
                            publish_frame(&mut swarm, &sub, &frame);
                        }
                        match swarm.behaviour_mut().gossipsub.unsubscribe(&topic) {
                            Ok(_) => info!("Unsubscribed from {}", topic),
                            Err(e) => warn!("Failed to unsubscribe from {}: {}", topic, e),
                        }
                    }
                }
            }
        }
    }
}
