//! Nmap XML snippets shared by the unit tests.

pub const FULL_HOST: &str = r#"<host starttime="1700000000" endtime="1700000042" comment="nas box">
<status state="up" reason="arp-response" reason_ttl="0"/>
<address addr="192.168.1.20" addrtype="ipv4"/>
<address addr="00:11:22:33:44:55" addrtype="mac" vendor="Synology"/>
<hostnames>
<hostname name="files.lan" type="PTR"/>
<hostname name="nas.lan" type="user"/>
</hostnames>
<ports>
<extraports state="closed" count="998"><extrareasons reason="resets" count="998"/></extraports>
<port protocol="tcp" portid="22"><state state="open" reason="syn-ack" reason_ttl="64"/><service name="ssh" product="OpenSSH" version="9.6" method="probed" conf="10"/><script id="ssh-hostkey" output="2048 aa:bb (RSA)&#xa;256 cc:dd (ED25519)"><elem key="bits">2048</elem></script></port>
<port protocol="udp" portid="53"><state state="open|filtered" reason="no-response" reason_ttl="0"/><service name="domain" method="table" conf="3"/></port>
</ports>
<hostscript>
<script id="smb-os-discovery" output="OS: Linux"/>
</hostscript>
<times srtt="512" rttvar="100" to="100000"/>
</host>"#;

pub fn report(hosts: &[&str]) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<nmaprun scanner=\"nmap\" args=\"nmap -oX -\" version=\"7.94\">\n{}\n<runstats><finished time=\"1700000100\" exit=\"success\"/></runstats>\n</nmaprun>\n",
        hosts.join("\n")
    )
}

/// A host that is up, has one IPv4 address and the given ports with no scripts.
pub fn simple_host(addr: &str, ports: &[(u16, &str, &str, &str)]) -> String {
    let ports: String = ports
        .iter()
        .map(|(id, proto, state, service)| {
            format!(
                "<port protocol=\"{proto}\" portid=\"{id}\"><state state=\"{state}\" reason=\"syn-ack\"/><service name=\"{service}\"/></port>"
            )
        })
        .collect();
    format!(
        "<host><status state=\"up\" reason=\"echo-reply\"/><address addr=\"{addr}\" addrtype=\"ipv4\"/><hostnames/><ports>{ports}</ports></host>"
    )
}

pub fn single_host_report(addr: &str, ports: &[(u16, &str, &str, &str)]) -> Vec<u8> {
    report(&[&simple_host(addr, ports)]).into_bytes()
}
